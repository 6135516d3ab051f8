use crate::resolve::{profile_path, slugify};
use anyhow::{bail, Context, Result};
use csv::{QuoteStyle, Terminator, WriterBuilder};
use rustc_hash::FxHashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One line of the redirect table: alternate path → canonical page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub kind: char,
    pub source: String,
    pub title: String,
    pub target: String,
}

impl Redirect {
    pub fn question(id: i64) -> Self {
        Self {
            kind: 'A',
            source: format!("element/{}", id),
            title: format!("Question {}", id),
            target: format!("A/question/{}.html", id),
        }
    }

    pub fn answer(answer_id: i64, question_id: i64) -> Self {
        Self {
            kind: 'A',
            source: format!("element/{}", answer_id),
            title: format!("Answer {}", answer_id),
            target: format!("A/question/{}.html", question_id),
        }
    }

    pub fn user(id: i64, display_name: &str) -> Self {
        Self {
            kind: 'A',
            source: format!("user/{}", profile_path(id, display_name)),
            title: format!("User {}", slugify(display_name)),
            target: format!("A/user/{}", id),
        }
    }

    fn fields(&self) -> [String; 4] {
        [
            self.kind.to_string(),
            sanitize_field(&self.source),
            sanitize_field(&self.title),
            sanitize_field(&self.target),
        ]
    }
}

/// Tabs and line breaks would corrupt the table; collapse them into spaces.
fn sanitize_field(s: &str) -> String {
    if s.contains(['\t', '\n', '\r']) {
        s.split(['\t', '\n', '\r'])
            .flat_map(str::split_whitespace)
            .collect::<Vec<_>>()
            .join(" ")
    } else {
        s.to_string()
    }
}

/// Append-only, tab-separated redirect table.
///
/// Sources are unique within a dump, so a fresh table writes every line it is
/// given. A resumed table only remembers the lines that follow the last commit,
/// and skips each of them once when the replay reaches it again.
pub struct RedirectSink {
    path: PathBuf,
    writer: csv::Writer<File>,
    pending: FxHashSet<String>,
    written: u64,
}

impl RedirectSink {
    /// Starts an empty table, replacing any file at `path`.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create redirect table: {:?}", path))?;
        Ok(Self::from_file(path, file, FxHashSet::default()))
    }

    /// Reopens the table of an interrupted run whose last commit covered
    /// `committed` lines.
    pub fn resume(path: &Path, committed: u64) -> Result<Self> {
        let pending = if path.exists() {
            recover_tail(path, committed)?
        } else if committed > 0 {
            bail!("Redirect table {:?} is missing", path);
        } else {
            FxHashSet::default()
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open redirect table: {:?}", path))?;
        info!(
            committed = committed,
            uncommitted = pending.len(),
            "Appending to existing redirect table"
        );
        Ok(Self::from_file(path, file, pending))
    }

    fn from_file(path: &Path, file: File, pending: FxHashSet<String>) -> Self {
        let writer = WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .quote_style(QuoteStyle::Never)
            .terminator(Terminator::Any(b'\n'))
            .from_writer(file);
        Self {
            path: path.to_path_buf(),
            writer,
            pending,
            written: 0,
        }
    }

    /// Writes every redirect of one record, then flushes once.
    pub fn append_group(&mut self, group: &[Redirect]) -> Result<()> {
        for redirect in group {
            if !self.pending.is_empty() && self.pending.remove(&redirect.source) {
                debug!(source = %redirect.source, "Redirect already in table");
                continue;
            }
            self.writer
                .write_record(redirect.fields())
                .with_context(|| format!("Failed to write redirect table: {:?}", self.path))?;
            self.written += 1;
        }
        self.writer
            .flush()
            .with_context(|| format!("Failed to flush redirect table: {:?}", self.path))
    }

    /// Syncs the table so an index commit never counts lines the disk lacks.
    pub fn commit(&mut self) -> Result<()> {
        self.writer
            .flush()
            .with_context(|| format!("Failed to flush redirect table: {:?}", self.path))?;
        self.writer
            .get_ref()
            .sync_data()
            .with_context(|| format!("Failed to sync redirect table: {:?}", self.path))
    }

    /// Lines written through this sink.
    pub fn written(&self) -> u64 {
        self.written
    }
}

/// Collects the sources of the complete lines past the first `committed`,
/// dropping an unterminated last line.
fn recover_tail(path: &Path, committed: u64) -> Result<FxHashSet<String>> {
    let file =
        File::open(path).with_context(|| format!("Failed to read redirect table: {:?}", path))?;
    let mut reader = BufReader::new(file);
    let mut line = Vec::new();
    let mut lines = 0u64;
    let mut valid = 0u64;
    let mut pending = FxHashSet::default();

    loop {
        line.clear();
        let n = reader
            .read_until(b'\n', &mut line)
            .with_context(|| format!("Failed to read redirect table: {:?}", path))?;
        if n == 0 {
            break;
        }
        if !line.ends_with(b"\n") {
            warn!(path = ?path, dropped = n, "Discarding partial redirect line");
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid)
                .with_context(|| format!("Failed to truncate redirect table: {:?}", path))?;
            break;
        }
        valid += n as u64;
        lines += 1;
        if lines > committed {
            if let Some(source) = line.split(|&b| b == b'\t').nth(1) {
                pending.insert(String::from_utf8_lossy(source).into_owned());
            }
        }
    }

    if lines < committed {
        bail!(
            "Redirect table {:?} holds {} lines, but {} were committed",
            path,
            lines,
            committed
        );
    }
    Ok(pending)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn question_with_two_answers_yields_three_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("redirects.tsv");
        let mut sink = RedirectSink::create(&path).unwrap();

        sink.append_group(&[
            Redirect::answer(11, 10),
            Redirect::answer(12, 10),
            Redirect::question(10),
        ])
        .unwrap();
        assert_eq!(sink.written(), 3);

        assert_eq!(
            lines(&path),
            vec![
                "A\telement/11\tAnswer 11\tA/question/10.html",
                "A\telement/12\tAnswer 12\tA/question/10.html",
                "A\telement/10\tQuestion 10\tA/question/10.html",
            ]
        );
    }

    #[test]
    fn user_line_format() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("redirects.tsv");
        let mut sink = RedirectSink::create(&path).unwrap();
        sink.append_group(&[Redirect::user(42, "Ada Lovelace")]).unwrap();
        assert_eq!(
            lines(&path),
            vec!["A\tuser/42/ada-lovelace\tUser ada-lovelace\tA/user/42"]
        );
    }

    #[test]
    fn fresh_table_keeps_no_sources_in_memory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("redirects.tsv");
        fs::write(&path, "A\telement/1\tQuestion 1\tA/question/1.html\n").unwrap();

        let mut sink = RedirectSink::create(&path).unwrap();
        for id in 0..500 {
            sink.append_group(&[Redirect::question(id)]).unwrap();
        }
        sink.commit().unwrap();
        assert!(sink.pending.is_empty());
        assert_eq!(sink.written(), 500);
        assert_eq!(lines(&path).len(), 500);
    }

    #[test]
    fn resume_skips_lines_written_after_the_last_commit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("redirects.tsv");
        fs::write(
            &path,
            "A\telement/1\tQuestion 1\tA/question/1.html\n\
             A\telement/2\tAnswer 2\tA/question/3.html\n\
             A\telement/3\tQuestion 3\tA/question/3.html\n\
             A\telement/4\tAns",
        )
        .unwrap();

        let mut sink = RedirectSink::resume(&path, 1).unwrap();
        assert_eq!(sink.pending.len(), 2);
        sink.append_group(&[Redirect::answer(2, 3), Redirect::question(3)])
            .unwrap();
        sink.append_group(&[Redirect::answer(4, 5), Redirect::question(5)])
            .unwrap();
        assert_eq!(sink.written(), 2);
        assert!(sink.pending.is_empty());
        assert_eq!(
            lines(&path),
            vec![
                "A\telement/1\tQuestion 1\tA/question/1.html",
                "A\telement/2\tAnswer 2\tA/question/3.html",
                "A\telement/3\tQuestion 3\tA/question/3.html",
                "A\telement/4\tAnswer 4\tA/question/5.html",
                "A\telement/5\tQuestion 5\tA/question/5.html",
            ]
        );
    }

    #[test]
    fn resume_requires_the_committed_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("redirects.tsv");
        fs::write(&path, "A\telement/1\tQuestion 1\tA/question/1.html\n").unwrap();
        assert!(RedirectSink::resume(&path, 2).is_err());
        assert!(RedirectSink::resume(&dir.path().join("missing.tsv"), 1).is_err());
        assert!(RedirectSink::resume(&dir.path().join("missing.tsv"), 0).is_ok());
    }

    #[test]
    fn fields_are_sanitized() {
        let r = Redirect {
            kind: 'A',
            source: "element/1".into(),
            title: "Line one\n\tline two".into(),
            target: "A/question/1.html".into(),
        };
        assert_eq!(r.fields()[2], "Line one line two");
    }
}

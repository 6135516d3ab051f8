use crate::config::{HOME_QUESTIONS, INDEX_VERSION, SORT_RUN_ROWS};
use crate::models::{IndexedUser, TagIndexEntry};
use crate::stats::{RunStats, StatsSnapshot};
use crate::store::{load_snapshot, save_atomic, Journal, RecordReader};
use anyhow::{bail, Context, Result};
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const USERS_JOURNAL: &str = "users.journal";
const TAGS_JOURNAL: &str = "question_tags.journal";
const SORTED_TAGS: &str = "question_tags.sorted";
const MANIFEST: &str = "manifest.bin";

/// One full pass over one entity stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Users,
    Posts,
    Tags,
}

impl Phase {
    /// The phase whose output this one reads.
    pub fn requires(self) -> Option<Phase> {
        match self {
            Phase::Users => None,
            Phase::Posts => Some(Phase::Users),
            Phase::Tags => Some(Phase::Posts),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Users => "users",
            Phase::Posts => "posts",
            Phase::Tags => "tags",
        };
        f.write_str(name)
    }
}

/// State of the index as of its last commit.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Manifest {
    pub version: u32,
    pub completed: Vec<Phase>,
    /// Records in the user journal
    pub users: u64,
    /// Records in the question/tag journal
    pub tag_rows: u64,
    /// Records of the unfinished phase already reflected in the journals
    pub phase_records: u64,
    pub stats: StatsSnapshot,
    /// Counters as they stood when the last phase completed
    pub completed_stats: StatsSnapshot,
}

/// Persistent store for resolved users and question/tag rows.
///
/// Only the parsing thread touches it, so it needs no locking.
pub struct DumpIndex {
    dir: PathBuf,
    users: FxHashMap<i64, IndexedUser>,
    user_log: Journal<IndexedUser>,
    tag_log: Journal<TagIndexEntry>,
    manifest: Manifest,
    current: Option<Phase>,
}

impl DumpIndex {
    /// Creates an empty index in `dir`.
    pub fn create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create index directory: {:?}", dir))?;
        let manifest = Manifest {
            version: INDEX_VERSION,
            ..Manifest::default()
        };
        save_atomic(&dir.join(MANIFEST), &manifest)?;

        info!(path = ?dir, "Created index");
        Ok(Self {
            dir: dir.to_path_buf(),
            users: FxHashMap::default(),
            user_log: Journal::create(&dir.join(USERS_JOURNAL))?,
            tag_log: Journal::create(&dir.join(TAGS_JOURNAL))?,
            manifest,
            current: None,
        })
    }

    /// Reads only the manifest of an existing index.
    pub fn inspect(dir: &Path) -> Result<Option<Manifest>> {
        load_snapshot(&dir.join(MANIFEST))
    }

    /// Reopens an index written by an earlier run at its last commit. Journal
    /// records written after that commit are discarded.
    pub fn open(dir: &Path) -> Result<Self> {
        let manifest: Manifest = Self::inspect(dir)?
            .with_context(|| format!("No index manifest in {:?}", dir))?;
        if manifest.version != INDEX_VERSION {
            bail!(
                "Index version mismatch: found {}, expected {}",
                manifest.version,
                INDEX_VERSION
            );
        }

        let mut users = FxHashMap::default();
        let user_log = Journal::recover(&dir.join(USERS_JOURNAL), manifest.users, |u: IndexedUser| {
            users.insert(u.id, u);
        })?;
        let tag_log = Journal::recover(&dir.join(TAGS_JOURNAL), manifest.tag_rows, |_: TagIndexEntry| {})?;

        info!(
            users = users.len(),
            tag_rows = tag_log.records(),
            completed = ?manifest.completed,
            phase_records = manifest.phase_records,
            "Opened existing index"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            users,
            user_log,
            tag_log,
            manifest,
            current: None,
        })
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn is_complete(&self, phase: Phase) -> bool {
        self.manifest.completed.contains(&phase)
    }

    /// Starts a phase, refusing to run it out of order or twice. Returns how
    /// many of its records an interrupted earlier run already committed.
    pub fn begin(&mut self, phase: Phase) -> Result<u64> {
        if let Some(running) = self.current {
            bail!("Cannot start {} phase while {} phase is running", phase, running);
        }
        if self.is_complete(phase) {
            bail!("The {} phase already completed for this index", phase);
        }
        if let Some(required) = phase.requires() {
            if !self.is_complete(required) {
                bail!(
                    "The {} phase requires the {} phase to complete first",
                    phase,
                    required
                );
            }
        }
        let committed = self.manifest.phase_records;
        if committed > 0 {
            info!(phase = %phase, records = committed, "Phase resumes after committed records");
        } else {
            debug!(phase = %phase, "Phase started");
        }
        self.current = Some(phase);
        Ok(committed)
    }

    pub fn complete(&mut self, phase: Phase, stats: &RunStats) -> Result<()> {
        if self.current != Some(phase) {
            bail!("The {} phase was never started", phase);
        }
        self.manifest.completed.push(phase);
        self.manifest.completed_stats = stats.snapshot();
        self.current = None;
        self.commit(stats, 0)?;
        info!(phase = %phase, "Phase complete");
        Ok(())
    }

    pub fn insert_user(&mut self, user: IndexedUser) -> Result<()> {
        self.user_log.append(&user)?;
        self.users.insert(user.id, user);
        Ok(())
    }

    pub fn user(&self, id: i64) -> Option<&IndexedUser> {
        self.users.get(&id)
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn append_tag_rows(&mut self, rows: &[TagIndexEntry]) -> Result<()> {
        for row in rows {
            self.tag_log.append(row)?;
        }
        Ok(())
    }

    pub fn tag_row_count(&self) -> u64 {
        self.tag_log.records()
    }

    /// Durability point: syncs both journals and rewrites the manifest.
    /// `phase_records` counts the records of the running phase covered so far.
    pub fn commit(&mut self, stats: &RunStats, phase_records: u64) -> Result<()> {
        self.user_log.commit()?;
        self.tag_log.commit()?;
        self.manifest.users = self.user_log.records();
        self.manifest.tag_rows = self.tag_log.records();
        self.manifest.phase_records = phase_records;
        self.manifest.stats = stats.snapshot();
        save_atomic(&self.dir.join(MANIFEST), &self.manifest)
    }

    /// Sorts every committed tag row on disk and builds the query structure for the Tags phase.
    pub fn tag_index(&self) -> Result<TagIndex> {
        TagIndex::build(self.tag_log.path(), &self.dir, SORT_RUN_ROWS, HOME_QUESTIONS)
    }
}

/// A tag row tagged with its journal position, so equal scores keep insertion order.
#[derive(Debug, Serialize, Deserialize)]
struct SortedRow {
    seq: u64,
    entry: TagIndexEntry,
}

impl Ord for SortedRow {
    /// Tag name, then descending score, then journal order.
    fn cmp(&self, other: &Self) -> Ordering {
        self.entry
            .tag
            .cmp(&other.entry.tag)
            .then(other.entry.score.cmp(&self.entry.score))
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for SortedRow {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SortedRow {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SortedRow {}

#[derive(Debug, Clone, Copy)]
struct TagSpan {
    offset: u64,
    rows: usize,
}

/// Read-only view of the question/tag rows, grouped by tag and ordered by score.
///
/// The rows live in a sorted file next to the journal; only one offset per tag
/// and the best scoring questions stay in memory.
#[derive(Debug)]
pub struct TagIndex {
    path: PathBuf,
    spans: FxHashMap<String, TagSpan>,
    top: Vec<TagIndexEntry>,
}

impl TagIndex {
    /// External merge sort of the journal at `rows`: sorted runs of at most
    /// `run_rows` rows are spilled to `dir`, then merged into one file.
    /// The `top` best scoring distinct questions are kept while streaming.
    pub fn build(rows: &Path, dir: &Path, run_rows: usize, top: usize) -> Result<Self> {
        let run_rows = run_rows.max(1);
        let mut best = Vec::with_capacity(top);
        let mut runs = Vec::new();
        let mut chunk = Vec::new();

        for (seq, entry) in RecordReader::<TagIndexEntry>::open(rows)?.enumerate() {
            let entry = entry?;
            offer_top(&mut best, top, &entry);
            chunk.push(SortedRow {
                seq: seq as u64,
                entry,
            });
            if chunk.len() == run_rows {
                runs.push(spill_run(dir, runs.len(), &mut chunk)?);
            }
        }
        if !chunk.is_empty() {
            runs.push(spill_run(dir, runs.len(), &mut chunk)?);
        }

        let path = dir.join(SORTED_TAGS);
        let (spans, total) = merge_runs(&runs, &path)?;
        for run in &runs {
            fs::remove_file(run).with_context(|| format!("Failed to remove sort run: {:?}", run))?;
        }

        info!(rows = total, tags = spans.len(), runs = runs.len(), "Tag index built");
        Ok(Self {
            path,
            spans,
            top: best,
        })
    }

    pub fn tag_count(&self) -> usize {
        self.spans.len()
    }

    /// Rows `tag` contributes, optionally capped.
    pub fn count(&self, tag: &str, cap: Option<usize>) -> usize {
        let rows = self.spans.get(tag).map_or(0, |span| span.rows);
        cap.map_or(rows, |cap| rows.min(cap))
    }

    /// Streams the rows for `tag` by descending score, optionally capped.
    pub fn rows(&self, tag: &str, cap: Option<usize>) -> Result<RecordReader<TagIndexEntry>> {
        let offset = self.spans.get(tag).map_or(0, |span| span.offset);
        RecordReader::open_at(&self.path, offset, Some(self.count(tag, cap) as u64))
    }

    pub fn questions_for(&self, tag: &str, cap: Option<usize>) -> Result<Vec<TagIndexEntry>> {
        self.rows(tag, cap)?.collect()
    }

    /// Highest scoring questions across all tags, each question listed once;
    /// equal scores list the lower id first.
    pub fn top_questions(&self) -> &[TagIndexEntry] {
        &self.top
    }
}

fn top_key(row: &TagIndexEntry) -> (Reverse<i64>, i64) {
    (Reverse(row.score), row.question_id)
}

/// Keeps `best` as the `limit` best distinct questions seen so far.
fn offer_top(best: &mut Vec<TagIndexEntry>, limit: usize, row: &TagIndexEntry) {
    if limit == 0 || best.iter().any(|b| b.question_id == row.question_id) {
        return;
    }
    let key = top_key(row);
    if best.len() == limit && best.last().is_some_and(|last| key >= top_key(last)) {
        return;
    }
    let at = best.partition_point(|b| top_key(b) < key);
    best.insert(at, row.clone());
    best.truncate(limit);
}

fn spill_run(dir: &Path, n: usize, chunk: &mut Vec<SortedRow>) -> Result<PathBuf> {
    chunk.par_sort_unstable();
    let path = dir.join(format!("{}.run{}", SORTED_TAGS, n));
    let mut run = Journal::create(&path)?;
    for row in chunk.iter() {
        run.append(row)?;
    }
    run.commit()?;
    debug!(run = n, rows = chunk.len(), "Spilled sorted run");
    chunk.clear();
    Ok(path)
}

/// K-way merge of sorted runs into `out`, recording where each tag starts.
fn merge_runs(runs: &[PathBuf], out: &Path) -> Result<(FxHashMap<String, TagSpan>, u64)> {
    let mut readers = runs
        .iter()
        .map(|run| RecordReader::<SortedRow>::open(run))
        .collect::<Result<Vec<_>>>()?;
    let mut heads = BinaryHeap::with_capacity(readers.len());
    for (n, reader) in readers.iter_mut().enumerate() {
        if let Some(row) = reader.next() {
            heads.push(Reverse((row?, n)));
        }
    }

    let mut sorted = Journal::<TagIndexEntry>::create(out)?;
    let mut spans: FxHashMap<String, TagSpan> = FxHashMap::default();
    while let Some(Reverse((row, n))) = heads.pop() {
        let offset = sorted.bytes();
        if let Some(span) = spans.get_mut(&row.entry.tag) {
            span.rows += 1;
        } else {
            spans.insert(row.entry.tag.clone(), TagSpan { offset, rows: 1 });
        }
        sorted.append(&row.entry)?;
        if let Some(next) = readers[n].next() {
            heads.push(Reverse((next?, n)));
        }
    }
    sorted.commit()?;
    Ok((spans, sorted.records()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(qid: i64, score: i64, tag: &str) -> TagIndexEntry {
        TagIndexEntry {
            score,
            title: format!("Question {}", qid),
            question_id: qid,
            creation_date: "2020-01-01T00:00:00.000".to_string(),
            tag: tag.to_string(),
        }
    }

    fn user(id: i64, name: &str) -> IndexedUser {
        IndexedUser {
            id,
            display_name: name.to_string(),
            reputation: 1,
        }
    }

    fn tag_index_of(dir: &TempDir, rows: &[TagIndexEntry], run_rows: usize) -> TagIndex {
        let mut index = DumpIndex::create(dir.path()).unwrap();
        index.append_tag_rows(rows).unwrap();
        index.commit(&RunStats::new(), 0).unwrap();
        TagIndex::build(&dir.path().join(TAGS_JOURNAL), dir.path(), run_rows, 10).unwrap()
    }

    fn ids(rows: &[TagIndexEntry]) -> Vec<i64> {
        rows.iter().map(|r| r.question_id).collect()
    }

    #[test]
    fn phases_must_run_in_order() {
        let dir = TempDir::new().unwrap();
        let stats = RunStats::new();
        let mut index = DumpIndex::create(dir.path()).unwrap();

        assert!(index.begin(Phase::Posts).is_err());
        assert!(index.begin(Phase::Tags).is_err());

        assert_eq!(index.begin(Phase::Users).unwrap(), 0);
        assert!(index.begin(Phase::Posts).is_err(), "users still running");
        index.complete(Phase::Users, &stats).unwrap();

        assert!(index.begin(Phase::Users).is_err(), "users already done");
        assert!(index.begin(Phase::Tags).is_err());
        index.begin(Phase::Posts).unwrap();
        index.complete(Phase::Posts, &stats).unwrap();
        index.begin(Phase::Tags).unwrap();
    }

    #[test]
    fn complete_requires_begin() {
        let dir = TempDir::new().unwrap();
        let mut index = DumpIndex::create(dir.path()).unwrap();
        assert!(index.complete(Phase::Users, &RunStats::new()).is_err());
    }

    #[test]
    fn user_lookup() {
        let dir = TempDir::new().unwrap();
        let mut index = DumpIndex::create(dir.path()).unwrap();
        index.insert_user(user(1, "Ada")).unwrap();
        index.insert_user(user(-1, "Community")).unwrap();

        assert_eq!(index.user(1).map(|u| u.display_name.as_str()), Some("Ada"));
        assert_eq!(index.user(-1).map(|u| u.display_name.as_str()), Some("Community"));
        assert!(index.user(2).is_none());
        assert_eq!(index.user_count(), 2);
    }

    #[test]
    fn reopen_replays_committed_state() {
        let dir = TempDir::new().unwrap();
        let stats = RunStats::new();
        {
            let mut index = DumpIndex::create(dir.path()).unwrap();
            index.begin(Phase::Users).unwrap();
            index.insert_user(user(7, "Grace")).unwrap();
            stats.inc_users();
            index.complete(Phase::Users, &stats).unwrap();
            index.begin(Phase::Posts).unwrap();
            index
                .append_tag_rows(&[entry(1, 5, "rust"), entry(1, 5, "xml")])
                .unwrap();
            stats.add_tag_rows(2);
            index.commit(&stats, 1).unwrap();
        }

        let manifest = DumpIndex::inspect(dir.path()).unwrap().unwrap();
        assert_eq!(manifest.completed, vec![Phase::Users]);
        assert_eq!(manifest.users, 1);
        assert_eq!(manifest.tag_rows, 2);
        assert_eq!(manifest.phase_records, 1);
        assert_eq!(manifest.stats.tag_rows, 2);
        assert_eq!(manifest.completed_stats.users, 1);
        assert_eq!(manifest.completed_stats.tag_rows, 0);

        let mut index = DumpIndex::open(dir.path()).unwrap();
        assert_eq!(index.user(7).map(|u| u.display_name.as_str()), Some("Grace"));
        assert_eq!(index.tag_row_count(), 2);
        assert!(index.is_complete(Phase::Users));
        assert!(!index.is_complete(Phase::Posts));
        assert!(index.begin(Phase::Users).is_err());
        assert_eq!(index.begin(Phase::Posts).unwrap(), 1);
    }

    #[test]
    fn reopen_discards_rows_after_the_last_commit() {
        let dir = TempDir::new().unwrap();
        let stats = RunStats::new();
        {
            let mut index = DumpIndex::create(dir.path()).unwrap();
            index.begin(Phase::Users).unwrap();
            index.insert_user(user(1, "Ada")).unwrap();
            index.commit(&stats, 1).unwrap();
            index.insert_user(user(2, "Grace")).unwrap();
            index.insert_user(user(3, "Edsger")).unwrap();
            // Flushed but never committed
            index.user_log.commit().unwrap();
        }

        let mut index = DumpIndex::open(dir.path()).unwrap();
        assert_eq!(index.user_count(), 1);
        assert!(index.user(2).is_none());
        assert_eq!(index.begin(Phase::Users).unwrap(), 1);

        index.insert_user(user(2, "Grace")).unwrap();
        index.commit(&stats, 2).unwrap();
        let rows = Journal::<IndexedUser>::read_all(&dir.path().join(USERS_JOURNAL)).unwrap();
        assert_eq!(rows.iter().map(|u| u.id).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn open_without_manifest_fails() {
        let dir = TempDir::new().unwrap();
        assert!(DumpIndex::open(dir.path()).is_err());
        assert!(DumpIndex::inspect(dir.path()).unwrap().is_none());
    }

    #[test]
    fn tag_index_from_committed_rows() {
        let dir = TempDir::new().unwrap();
        let mut index = DumpIndex::create(dir.path()).unwrap();
        index
            .append_tag_rows(&[entry(1, 2, "a"), entry(2, 9, "a"), entry(2, 9, "b")])
            .unwrap();
        index.commit(&RunStats::new(), 0).unwrap();

        let tags = index.tag_index().unwrap();
        assert_eq!(tags.tag_count(), 2);
        assert_eq!(ids(&tags.questions_for("a", None).unwrap()), vec![2, 1]);
        assert_eq!(ids(tags.top_questions()), vec![2, 1]);
    }

    #[test]
    fn questions_sorted_by_score_with_stable_ties() {
        let dir = TempDir::new().unwrap();
        let tags = tag_index_of(
            &dir,
            &[
                entry(1, 3, "rust"),
                entry(2, 10, "rust"),
                entry(3, 3, "rust"),
                entry(4, -1, "rust"),
                entry(5, 3, "rust"),
            ],
            1000,
        );
        assert_eq!(ids(&tags.questions_for("rust", None).unwrap()), vec![2, 1, 3, 5, 4]);
    }

    #[test]
    fn spilled_runs_merge_into_one_order() {
        let dir = TempDir::new().unwrap();
        // Interleaved tags and repeated scores spread over many runs of three rows
        let rows: Vec<TagIndexEntry> = (0..40)
            .map(|i| entry(i, i % 7, if i % 3 == 0 { "a" } else { "b" }))
            .collect();
        let tags = tag_index_of(&dir, &rows, 3);

        for tag in ["a", "b"] {
            let mut expected: Vec<&TagIndexEntry> = rows.iter().filter(|r| r.tag == tag).collect();
            expected.sort_by(|x, y| y.score.cmp(&x.score));
            let expected: Vec<i64> = expected.iter().map(|r| r.question_id).collect();
            assert_eq!(ids(&tags.questions_for(tag, None).unwrap()), expected, "tag {}", tag);
        }
        assert_eq!(tags.count("a", None), 14);
        assert_eq!(tags.count("b", None), 26);

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".run"))
            .collect();
        assert!(leftovers.is_empty(), "sort runs were not removed");
    }

    #[test]
    fn questions_for_respects_cap() {
        let dir = TempDir::new().unwrap();
        let rows: Vec<TagIndexEntry> = (0..250).map(|i| entry(i, i, "big")).collect();
        let tags = tag_index_of(&dir, &rows, 64);
        assert_eq!(tags.questions_for("big", Some(100)).unwrap().len(), 100);
        assert_eq!(tags.questions_for("big", Some(300)).unwrap().len(), 250);
        assert_eq!(tags.questions_for("big", None).unwrap()[0].question_id, 249);
        assert!(tags.questions_for("missing", None).unwrap().is_empty());
        assert_eq!(tags.count("missing", None), 0);
    }

    #[test]
    fn top_questions_are_distinct() {
        let dir = TempDir::new().unwrap();
        let tags = tag_index_of(
            &dir,
            &[
                entry(1, 50, "a"),
                entry(1, 50, "b"),
                entry(1, 50, "c"),
                entry(2, 40, "a"),
                entry(3, 60, "b"),
            ],
            2,
        );
        assert_eq!(ids(tags.top_questions()), vec![3, 1, 2]);
    }

    #[test]
    fn top_questions_keep_only_the_best() {
        let mut best = Vec::new();
        for (qid, score) in [(1, 5), (2, 9), (3, 5), (4, 1), (5, 9), (2, 9), (6, 7)] {
            offer_top(&mut best, 3, &entry(qid, score, "t"));
        }
        // Equal scores order by id
        assert_eq!(ids(&best), vec![2, 5, 6]);
    }
}

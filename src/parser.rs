use crate::error::StreamError;
use crate::models::RawRecord;
use anyhow::{Context, Result};
use bzip2::read::BzDecoder;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

const READ_BUFFER: usize = 1024 * 1024;

/// One structural event of a dump stream. Self-closing elements produce an
/// `Open` immediately followed by a matching `Close`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlEvent {
    Open { name: String, attrs: RawRecord },
    Close { name: String },
}

pub type FileDumpReader = DumpReader<Box<dyn BufRead + Send>>;

/// Forward-only reader over a dump file, yielding only element events.
pub struct DumpReader<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    depth: usize,
    pending_close: Option<String>,
    done: bool,
}

impl FileDumpReader {
    /// Opens a plain or `.bz2` compressed dump file.
    pub fn open(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("Failed to open dump file: {:?}", path))?;
        let is_bz2 = path.extension().map(|e| e == "bz2").unwrap_or(false);
        let inner: Box<dyn BufRead + Send> = if is_bz2 {
            Box::new(BufReader::with_capacity(READ_BUFFER, BzDecoder::new(file)))
        } else {
            Box::new(BufReader::with_capacity(READ_BUFFER, file))
        };
        Ok(Self::from_reader(inner))
    }
}

impl<R: BufRead> DumpReader<R> {
    pub fn from_reader(inner: R) -> Self {
        let mut reader = Reader::from_reader(inner);
        reader.trim_text(true);
        Self {
            reader,
            buf: Vec::new(),
            depth: 0,
            pending_close: None,
            done: false,
        }
    }

    /// Byte offset of the reader in the (decompressed) stream.
    pub fn position(&self) -> usize {
        self.reader.buffer_position()
    }
}

fn element(e: &BytesStart) -> Result<(String, RawRecord), quick_xml::Error> {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut attrs = RawRecord::new();
    for attr in e.attributes() {
        let attr = attr?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        attrs.insert(key, value);
    }
    Ok((name, attrs))
}

impl<R: BufRead> Iterator for DumpReader<R> {
    type Item = Result<XmlEvent, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(name) = self.pending_close.take() {
            return Some(Ok(XmlEvent::Close { name }));
        }
        if self.done {
            return None;
        }

        loop {
            self.buf.clear();
            let event = match self.reader.read_event_into(&mut self.buf) {
                Ok(event) => event,
                Err(source) => {
                    self.done = true;
                    return Some(Err(StreamError::Corruption {
                        position: self.reader.buffer_position(),
                        source,
                    }));
                }
            };

            let parsed = match event {
                Event::Start(ref e) => {
                    self.depth += 1;
                    element(e)
                }
                Event::Empty(ref e) => element(e).map(|(name, attrs)| {
                    self.pending_close = Some(name.clone());
                    (name, attrs)
                }),
                Event::End(ref e) => {
                    self.depth = self.depth.saturating_sub(1);
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    return Some(Ok(XmlEvent::Close { name }));
                }
                Event::Eof => {
                    self.done = true;
                    if self.depth > 0 {
                        return Some(Err(StreamError::Truncated { open: self.depth }));
                    }
                    return None;
                }
                _ => continue,
            };

            return Some(match parsed {
                Ok((name, attrs)) => Ok(XmlEvent::Open { name, attrs }),
                Err(source) => {
                    self.done = true;
                    Err(StreamError::Corruption {
                        position: self.reader.buffer_position(),
                        source,
                    })
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bzip2::write::BzEncoder;
    use bzip2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    fn events(xml: &str) -> Vec<Result<XmlEvent, StreamError>> {
        DumpReader::from_reader(xml.as_bytes()).collect()
    }

    fn names(xml: &str) -> Vec<String> {
        events(xml)
            .into_iter()
            .map(|e| match e.unwrap() {
                XmlEvent::Open { name, .. } => format!("+{}", name),
                XmlEvent::Close { name } => format!("-{}", name),
            })
            .collect()
    }

    #[test]
    fn empty_elements_open_and_close() {
        let xml = r#"<?xml version="1.0"?><users><row Id="1" DisplayName="Ada"/></users>"#;
        assert_eq!(names(xml), vec!["+users", "+row", "-row", "-users"]);
    }

    #[test]
    fn attributes_are_unescaped() {
        let xml = r#"<posts><post Id="5" Body="&lt;p&gt;hi &amp; bye&lt;/p&gt;"/></posts>"#;
        let all = events(xml);
        match &all[1] {
            Ok(XmlEvent::Open { name, attrs }) => {
                assert_eq!(name, "post");
                assert_eq!(attrs.get("Id"), Some("5"));
                assert_eq!(attrs.get("Body"), Some("<p>hi & bye</p>"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn nested_structure_is_preserved() {
        let xml = "<root><post Id=\"1\"><answers><row Id=\"2\"/></answers></post></root>";
        assert_eq!(
            names(xml),
            vec!["+root", "+post", "+answers", "+row", "-row", "-answers", "-post", "-root"]
        );
    }

    #[test]
    fn mismatched_end_is_corruption() {
        let all = events("<root><post></root>");
        assert!(matches!(
            all.last(),
            Some(Err(StreamError::Corruption { .. }))
        ));
    }

    #[test]
    fn unterminated_stream_is_truncated() {
        let all = events("<root><post Id=\"1\">");
        assert!(matches!(
            all.last(),
            Some(Err(StreamError::Truncated { open: 2 }))
        ));
    }

    #[test]
    fn iteration_stops_after_error() {
        let mut reader = DumpReader::from_reader("<root><a></b>".as_bytes());
        while let Some(event) = reader.next() {
            if event.is_err() {
                break;
            }
        }
        assert!(reader.next().is_none());
    }

    #[test]
    fn open_reads_bz2_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Tags.xml.bz2");
        let mut encoder = BzEncoder::new(File::create(&path).unwrap(), Compression::fast());
        encoder
            .write_all(br#"<tags><row TagName="rust" Count="3"/></tags>"#)
            .unwrap();
        encoder.finish().unwrap();

        let reader = FileDumpReader::open(&path).unwrap();
        let opened: Vec<_> = reader
            .filter_map(|e| match e.unwrap() {
                XmlEvent::Open { attrs, .. } => attrs.get("TagName").map(str::to_string),
                _ => None,
            })
            .collect();
        assert_eq!(opened, vec!["rust".to_string()]);
    }

    #[test]
    fn open_missing_file_fails() {
        assert!(FileDumpReader::open(Path::new("/nonexistent/Posts.xml")).is_err());
    }
}

use crate::config::{TagDepth, HOME_TAGS, TAG_PAGE_SIZE};
use crate::content::quote_segment;
use crate::error::RecordError;
use crate::index::TagIndex;
use crate::models::{AllTagsPage, HomePage, RawRecord, TagIndexEntry, TagPage, TagSummary};
use crate::store::RecordReader;
use anyhow::{bail, Result};
use rustc_hash::FxHashSet;

/// Reads one `row` of the Tags stream. Tags no question uses yield `None`.
pub fn tag_from_row(row: &RawRecord) -> Result<Option<TagSummary>, RecordError> {
    let name = row.require("TagName")?;
    let count = row.opt_int("Count")?.unwrap_or(0);
    if count <= 0 {
        return Ok(None);
    }
    Ok(Some(TagSummary {
        name: name.to_string(),
        url: quote_segment(name),
        question_count: count as u64,
    }))
}

/// Collects tag rows in stream order, keeping the first row of a repeated name.
#[derive(Debug, Default)]
pub struct TagCollector {
    tags: Vec<TagSummary>,
    seen: FxHashSet<String>,
}

impl TagCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the name was already collected.
    pub fn push(&mut self, tag: TagSummary) -> bool {
        if !self.seen.insert(tag.name.clone()) {
            return false;
        }
        self.tags.push(tag);
        true
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Every tag by question count, descending; equal counts keep stream order.
    pub fn into_sorted(mut self) -> Vec<TagSummary> {
        self.tags.sort_by(|a, b| b.question_count.cmp(&a.question_count));
        self.tags
    }
}

/// Most used tags and best scoring questions.
pub fn home_page(sorted_tags: &[TagSummary], index: &TagIndex) -> HomePage {
    HomePage {
        tags: sorted_tags.iter().take(HOME_TAGS).cloned().collect(),
        questions: index.top_questions().to_vec(),
    }
}

pub fn all_tags_page(sorted_tags: &[TagSummary]) -> AllTagsPage {
    AllTagsPage {
        tags: sorted_tags.to_vec(),
    }
}

/// Paginates a tag's questions by score. Every row up to the depth cap lands
/// on exactly one page, and a tag always gets at least one page. Rows are read
/// from disk one page at a time.
pub fn tag_pages<'a>(
    tag: &'a TagSummary,
    index: &TagIndex,
    depth: TagDepth,
) -> Result<TagPages<'a>> {
    let total = index.count(&tag.name, depth.cap());
    Ok(TagPages {
        tag,
        rows: index.rows(&tag.name, depth.cap())?,
        total,
        pages: total.div_ceil(TAG_PAGE_SIZE).max(1),
        next: 0,
    })
}

pub struct TagPages<'a> {
    tag: &'a TagSummary,
    rows: RecordReader<TagIndexEntry>,
    total: usize,
    pages: usize,
    next: usize,
}

impl TagPages<'_> {
    fn page(&mut self, n: usize) -> Result<TagPage> {
        let start = n * TAG_PAGE_SIZE;
        let end = (start + TAG_PAGE_SIZE).min(self.total);
        let questions = self
            .rows
            .by_ref()
            .take(end - start)
            .collect::<Result<Vec<_>>>()?;
        if questions.len() < end - start {
            bail!("Sorted rows for tag {:?} ended early", self.tag.name);
        }
        Ok(TagPage {
            tag: self.tag.name.clone(),
            url: self.tag.url.clone(),
            index: n + 1,
            questions,
            has_next: end < self.total,
            has_previous: n > 0,
        })
    }
}

impl Iterator for TagPages<'_> {
    type Item = Result<TagPage>;

    fn next(&mut self) -> Option<Result<TagPage>> {
        if self.next >= self.pages {
            return None;
        }
        let n = self.next;
        self.next += 1;
        let page = self.page(n);
        if page.is_err() {
            self.next = self.pages;
        }
        Some(page)
    }
}

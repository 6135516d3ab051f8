use crate::config::ANONYMOUS_NAME;
use crate::error::RecordError;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Attribute map of one XML element, alive only while that element is processed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRecord {
    attrs: FxHashMap<String, String>,
}

impl RawRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attrs.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    pub fn require(&self, key: &'static str) -> Result<&str, RecordError> {
        self.get(key).ok_or(RecordError::MissingField(key))
    }

    pub fn take(&mut self, key: &str) -> Option<String> {
        self.attrs.remove(key)
    }

    /// Required integer attribute.
    pub fn int(&self, key: &'static str) -> Result<i64, RecordError> {
        parse_int(key, self.require(key)?)
    }

    /// Integer attribute that may be absent, but must be numeric when present.
    pub fn opt_int(&self, key: &'static str) -> Result<Option<i64>, RecordError> {
        self.get(key).map(|v| parse_int(key, v)).transpose()
    }

    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    /// Whatever attributes are left, in a stable order for the renderer.
    pub fn into_extra(self) -> BTreeMap<String, String> {
        self.attrs.into_iter().collect()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RawRecord {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            attrs: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

fn parse_int(field: &'static str, value: &str) -> Result<i64, RecordError> {
    value
        .trim()
        .parse()
        .map_err(|_| RecordError::NotAnInteger {
            field,
            value: value.to_string(),
        })
}

/// User row as persisted in the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedUser {
    pub id: i64,
    pub display_name: String,
    pub reputation: i64,
}

/// A resolved reference to a known user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: i64,
    pub display_name: String,
    pub reputation: i64,
    /// Profile path, only present when user pages are generated
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Owner {
    Known(UserRef),
    /// The post names a user id that has no row in the index
    Deleted { id: i64 },
    /// No user id, only a free-text display name
    Named { display_name: String },
    Anonymous,
}

impl Owner {
    pub fn display_name(&self) -> &str {
        match self {
            Owner::Known(user) => &user.display_name,
            Owner::Named { display_name } => display_name,
            Owner::Deleted { .. } | Owner::Anonymous => ANONYMOUS_NAME,
        }
    }

    pub fn path(&self) -> Option<&str> {
        match self {
            Owner::Known(user) => user.path.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: Option<i64>,
    pub score: Option<i64>,
    /// HTML, rewritten for offline use by the worker
    pub text: String,
    pub creation_date: Option<String>,
    pub user_id: Option<i64>,
    pub user_display_name: String,
    pub user_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    pub id: i64,
    pub score: i64,
    pub body: String,
    pub creation_date: Option<String>,
    pub owner: Owner,
    pub accepted: bool,
    pub comments: Vec<Comment>,
    pub extra: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    Related,
    Duplicate,
}

impl LinkKind {
    /// Maps the dump's `LinkTypeId`; other link types carry no page content.
    pub fn from_type_id(id: &str) -> Option<Self> {
        match id {
            "1" => Some(LinkKind::Related),
            "3" => Some(LinkKind::Duplicate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostLink {
    pub source_id: i64,
    pub target_id: i64,
    pub target_title: String,
    pub kind: LinkKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub id: i64,
    /// Raw title; renderers escape it
    pub title: String,
    pub score: i64,
    pub body: String,
    pub tags: Vec<String>,
    pub creation_date: String,
    pub accepted_answer_id: Option<i64>,
    pub owner: Owner,
    pub comments: Vec<Comment>,
    pub answers: Vec<Answer>,
    pub related: Vec<PostLink>,
    pub duplicates: Vec<PostLink>,
    pub extra: BTreeMap<String, String>,
}

impl Question {
    pub fn filename(&self) -> String {
        format!("{}.html", self.id)
    }

    pub fn push_link(&mut self, link: PostLink) {
        match link.kind {
            LinkKind::Related => self.related.push(link),
            LinkKind::Duplicate => self.duplicates.push(link),
        }
    }
}

/// One row per (question, tag) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagIndexEntry {
    pub score: i64,
    pub title: String,
    pub question_id: i64,
    pub creation_date: String,
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: i64,
    pub display_name: String,
    pub reputation: i64,
    pub profile_image_url: Option<String>,
    pub about_me: Option<String>,
    pub badges: BTreeMap<String, u32>,
    pub path: Option<String>,
    pub extra: BTreeMap<String, String>,
}

impl UserProfile {
    pub fn indexed(&self) -> IndexedUser {
        IndexedUser {
            id: self.id,
            display_name: self.display_name.clone(),
            reputation: self.reputation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagSummary {
    pub name: String,
    /// Percent-encoded path segment for the tag's pages
    pub url: String,
    pub question_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagPage {
    pub tag: String,
    pub url: String,
    /// 1-based page number
    pub index: usize,
    pub questions: Vec<TagIndexEntry>,
    pub has_next: bool,
    pub has_previous: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HomePage {
    pub tags: Vec<TagSummary>,
    pub questions: Vec<TagIndexEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllTagsPage {
    pub tags: Vec<TagSummary>,
}

use crate::config::{SiteConfig, ANONYMOUS_NAME};
use crate::error::RecordError;
use crate::index::DumpIndex;
use crate::markdown::{comment_html, MarkdownConverter};
use crate::models::{
    Answer, Comment, IndexedUser, Owner, Question, RawRecord, TagIndexEntry, UserProfile, UserRef,
};
use crate::stats::RunStats;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

static ANGLE_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<([^<>]+)>").unwrap());

/// Turns raw attribute maps into resolved entities, consulting the index for owners.
pub struct Resolver {
    user_profiles: bool,
    markdown: Arc<dyn MarkdownConverter>,
    stats: Arc<RunStats>,
}

impl Resolver {
    pub fn new(
        config: &SiteConfig,
        markdown: Arc<dyn MarkdownConverter>,
        stats: Arc<RunStats>,
    ) -> Self {
        Self {
            user_profiles: config.user_profiles,
            markdown,
            stats,
        }
    }

    pub fn user_ref(&self, user: &IndexedUser) -> UserRef {
        UserRef {
            id: user.id,
            display_name: user.display_name.clone(),
            reputation: user.reputation,
            path: self.path_for(user.id, &user.display_name),
        }
    }

    fn path_for(&self, id: i64, display_name: &str) -> Option<String> {
        self.user_profiles.then(|| profile_path(id, display_name))
    }

    /// Owner from an id attribute, falling back to a free-text name, then to anonymous.
    pub fn resolve_owner(
        &self,
        index: &DumpIndex,
        raw: &mut RawRecord,
        id_key: &'static str,
        name_key: &'static str,
    ) -> Result<Owner, RecordError> {
        let owner = match raw.opt_int(id_key)? {
            Some(id) => match index.user(id) {
                Some(user) => Owner::Known(self.user_ref(user)),
                None => {
                    debug!(user_id = id, "Owner not found in index");
                    self.stats.inc_unresolved();
                    Owner::Deleted { id }
                }
            },
            None => match raw.get(name_key) {
                Some(name) => Owner::Named {
                    display_name: name.to_string(),
                },
                None => Owner::Anonymous,
            },
        };
        raw.take(id_key);
        raw.take(name_key);
        Ok(owner)
    }

    pub fn resolve_question(
        &self,
        index: &DumpIndex,
        mut raw: RawRecord,
    ) -> Result<Question, RecordError> {
        let id = raw.int("Id")?;
        let score = raw.int("Score")?;
        let accepted_answer_id = raw.opt_int("AcceptedAnswerId")?;
        let title = raw.take("Title").ok_or(RecordError::MissingField("Title"))?;
        let owner = self.resolve_owner(index, &mut raw, "OwnerUserId", "OwnerDisplayName")?;
        let tags = raw.take("Tags").map(|t| parse_tags(&t)).unwrap_or_default();

        for key in ["Id", "Score", "AcceptedAnswerId"] {
            raw.take(key);
        }
        Ok(Question {
            id,
            title,
            score,
            body: raw.take("Body").unwrap_or_default(),
            tags,
            creation_date: raw.take("CreationDate").unwrap_or_default(),
            accepted_answer_id,
            owner,
            comments: Vec::new(),
            answers: Vec::new(),
            related: Vec::new(),
            duplicates: Vec::new(),
            extra: raw.into_extra(),
        })
    }

    /// `accepted` stays false until the answer group closes, see [`finalize_answers`].
    pub fn resolve_answer(
        &self,
        index: &DumpIndex,
        mut raw: RawRecord,
    ) -> Result<Answer, RecordError> {
        let id = raw.int("Id")?;
        let score = raw.int("Score")?;
        let owner = self.resolve_owner(index, &mut raw, "OwnerUserId", "OwnerDisplayName")?;
        raw.take("Id");
        raw.take("Score");
        Ok(Answer {
            id,
            score,
            body: raw.take("Body").unwrap_or_default(),
            creation_date: raw.take("CreationDate"),
            owner,
            accepted: false,
            comments: Vec::new(),
            extra: raw.into_extra(),
        })
    }

    pub fn resolve_comment(
        &self,
        index: &DumpIndex,
        raw: RawRecord,
    ) -> Result<Comment, RecordError> {
        let score = raw.opt_int("Score")?;
        let id = raw.opt_int("Id")?;
        let user_id = raw.opt_int("UserId")?;
        let (user_display_name, user_path) = match user_id.and_then(|uid| index.user(uid)) {
            Some(user) => (
                user.display_name.clone(),
                self.path_for(user.id, &user.display_name),
            ),
            None => {
                if let Some(uid) = user_id {
                    debug!(user_id = uid, "Comment author not found in index");
                    self.stats.inc_unresolved();
                }
                (ANONYMOUS_NAME.to_string(), None)
            }
        };
        let text = raw.get("Text").unwrap_or_default();
        Ok(Comment {
            id,
            score,
            text: comment_html(self.markdown.as_ref(), text),
            creation_date: raw.get("CreationDate").map(str::to_string),
            user_id,
            user_display_name,
            user_path,
        })
    }

    pub fn resolve_user(
        &self,
        mut raw: RawRecord,
        badges: BTreeMap<String, u32>,
    ) -> Result<UserProfile, RecordError> {
        let id = raw.int("Id")?;
        let reputation = raw.opt_int("Reputation")?.unwrap_or(0);
        let display_name = raw
            .take("DisplayName")
            .ok_or(RecordError::MissingField("DisplayName"))?;
        raw.take("Id");
        raw.take("Reputation");
        Ok(UserProfile {
            id,
            path: self.path_for(id, &display_name),
            display_name,
            reputation,
            profile_image_url: raw.take("ProfileImageUrl"),
            about_me: raw.take("AboutMe"),
            badges,
            extra: raw.into_extra(),
        })
    }
}

/// Marks the accepted answer and orders the group: accepted first, then by
/// score descending. The sort is stable, so ties keep dump order.
pub fn finalize_answers(answers: &mut [Answer], accepted_answer_id: Option<i64>) {
    for answer in answers.iter_mut() {
        answer.accepted = Some(answer.id) == accepted_answer_id;
    }
    answers.sort_by(|a, b| b.accepted.cmp(&a.accepted).then(b.score.cmp(&a.score)));
}

/// One index row per tag of the question, in tag order.
pub fn tag_rows(question: &Question) -> Vec<TagIndexEntry> {
    question
        .tags
        .iter()
        .map(|tag| TagIndexEntry {
            score: question.score,
            title: question.title.clone(),
            question_id: question.id,
            creation_date: question.creation_date.clone(),
            tag: tag.clone(),
        })
        .collect()
}

/// Splits `<a><b><c>` (or the newer `|a|b|c|`) into `[a, b, c]`.
pub fn parse_tags(raw: &str) -> Vec<String> {
    let raw = raw.trim();
    if raw.starts_with('<') {
        return ANGLE_TAG
            .captures_iter(raw)
            .map(|caps| caps[1].to_string())
            .collect();
    }
    let parts: Vec<&str> = if raw.starts_with('|') {
        raw.split('|').collect()
    } else {
        raw.split_whitespace().collect()
    };
    parts
        .into_iter()
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Lower-cased display name with runs of anything non-alphanumeric collapsed to `-`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars().flat_map(char::to_lowercase) {
        if c.is_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c);
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        slug.push_str("user");
    }
    slug
}

pub fn profile_path(id: i64, display_name: &str) -> String {
    format!("{}/{}", id, slugify(display_name))
}

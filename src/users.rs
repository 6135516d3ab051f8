use crate::error::RecordError;
use crate::models::{RawRecord, UserProfile};
use crate::parser::XmlEvent;
use crate::resolve::Resolver;
use std::collections::BTreeMap;
use tracing::debug;

/// Outcome of one closed `row` in the Users stream.
#[derive(Debug)]
pub enum AssembledUser {
    User(Box<UserProfile>),
    Failed { id: Option<String>, error: RecordError },
}

/// Builds user profiles from `row` elements and the `badge` elements nested in them.
pub struct UserAssembler {
    resolver: Resolver,
    row: Option<RawRecord>,
    badges: BTreeMap<String, u32>,
}

impl UserAssembler {
    pub fn new(resolver: Resolver) -> Self {
        Self {
            resolver,
            row: None,
            badges: BTreeMap::new(),
        }
    }

    pub fn feed(&mut self, event: XmlEvent) -> Option<AssembledUser> {
        match event {
            XmlEvent::Open { name, attrs } => {
                match name.as_str() {
                    "row" => {
                        self.row = Some(attrs);
                        self.badges.clear();
                    }
                    "badge" if self.row.is_some() => {
                        if let Some(badge) = attrs.get("Name") {
                            *self.badges.entry(badge.to_string()).or_insert(0) += 1;
                        }
                    }
                    "badges" | "users" => {}
                    other => debug!(element = other, "Ignoring element in users stream"),
                }
                None
            }
            XmlEvent::Close { name } if name == "row" => {
                let raw = self.row.take()?;
                let id = raw.get("Id").map(str::to_string);
                let badges = std::mem::take(&mut self.badges);
                Some(match self.resolver.resolve_user(raw, badges) {
                    Ok(user) => AssembledUser::User(Box::new(user)),
                    Err(error) => AssembledUser::Failed { id, error },
                })
            }
            XmlEvent::Close { .. } => None,
        }
    }
}

use crate::models::{AllTagsPage, HomePage, Question, TagPage, UserProfile};
use crate::pool::Job;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// One output page, fully resolved and self-contained.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "page", content = "data", rename_all = "snake_case")]
pub enum Page {
    Question(Box<Question>),
    User(Box<UserProfile>),
    Tag(TagPage),
    Home(HomePage),
    AllTags(AllTagsPage),
}

impl Page {
    /// Location of the page relative to the output directory, without extension.
    pub fn relative_path(&self) -> PathBuf {
        match self {
            Page::Question(q) => Path::new("question").join(q.id.to_string()),
            Page::User(u) => Path::new("user").join(u.id.to_string()),
            Page::Tag(t) => Path::new("tag").join(&t.url).join(t.index.to_string()),
            Page::Home(_) => PathBuf::from("index"),
            Page::AllTags(_) => PathBuf::from("alltags"),
        }
    }
}

impl Job for Page {
    fn label(&self) -> String {
        match self {
            Page::Question(q) => format!("question {}", q.id),
            Page::User(u) => format!("user {}", u.id),
            Page::Tag(t) => format!("tag {} page {}", t.tag, t.index),
            Page::Home(_) => "home".to_string(),
            Page::AllTags(_) => "all tags".to_string(),
        }
    }
}

/// Turns a page into an output artifact. Called concurrently from every worker,
/// each call writing an independent file.
pub trait Renderer: Send + Sync {
    fn render(&self, page: &Page) -> Result<()>;
}

/// Writes each page as pretty-printed JSON under the output directory.
#[derive(Debug, Clone)]
pub struct JsonRenderer {
    output_dir: PathBuf,
}

impl JsonRenderer {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn path_for(&self, page: &Page) -> PathBuf {
        self.output_dir
            .join(page.relative_path())
            .with_extension("json")
    }
}

impl Renderer for JsonRenderer {
    fn render(&self, page: &Page) -> Result<()> {
        let path = self.path_for(page);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }
        let file =
            File::create(&path).with_context(|| format!("Failed to create page: {:?}", path))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, page)
            .with_context(|| format!("Failed to serialize {}", page.label()))?;
        writer.flush()?;
        Ok(())
    }
}

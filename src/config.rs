use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Commit the index every N records of a phase
pub const COMMIT_INTERVAL: u64 = 1000;

/// Progress update interval (tick every N records)
pub const PROGRESS_INTERVAL: u64 = 1000;

/// Pending render jobs allowed per worker before submitters block
pub const QUEUE_SLOTS_PER_WORKER: usize = 2;

/// Questions per paginated tag page
pub const TAG_PAGE_SIZE: usize = 100;

/// Questions listed on the home page
pub const HOME_QUESTIONS: usize = 50;

/// Tags listed on the home page
pub const HOME_TAGS: usize = 200;

/// Tag rows sorted in memory at once before spilling a run to disk
pub const SORT_RUN_ROWS: usize = 200_000;

/// Bump when the on-disk index layout changes
pub const INDEX_VERSION: u32 = 1;

/// Display name used when an owner cannot be resolved
pub const ANONYMOUS_NAME: &str = "None";

/// Comment text used when markdown conversion yields nothing
pub const COMMENT_PLACEHOLDER: &str = "-";

/// Image reference substituted when an image cannot be fetched
pub const IMAGE_PLACEHOLDER: &str = "../favicon.png";

/// How many questions, ordered by score, a tag's pages may list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagDepth {
    Unlimited,
    Limited(usize),
}

impl TagDepth {
    /// `-1` means unlimited; anything else must be a positive multiple of the page size.
    pub fn parse(value: i64) -> Result<Self> {
        if value == -1 {
            return Ok(TagDepth::Unlimited);
        }
        if value <= 0 || value % TAG_PAGE_SIZE as i64 != 0 {
            bail!(
                "tag depth must be -1 or a positive multiple of {}, got {}",
                TAG_PAGE_SIZE,
                value
            );
        }
        Ok(TagDepth::Limited(value as usize))
    }

    pub fn cap(&self) -> Option<usize> {
        match self {
            TagDepth::Unlimited => None,
            TagDepth::Limited(n) => Some(*n),
        }
    }
}

/// Switches the ingestion core consults while resolving and rewriting records.
#[derive(Debug, Clone)]
pub struct SiteConfig {
    /// Bare host name of the community, e.g. `physics.stackexchange.com`
    pub domain: String,
    pub workers: usize,
    pub exclude_unanswered: bool,
    pub user_profiles: bool,
    pub external_links: bool,
    pub images: bool,
    /// Download profile pictures (ignored when `images` is off)
    pub avatars: bool,
    pub tag_depth: TagDepth,
}

impl SiteConfig {
    pub fn new(domain: &str) -> Self {
        Self {
            domain: normalize_domain(domain),
            workers: default_workers(),
            exclude_unanswered: false,
            user_profiles: true,
            external_links: true,
            images: true,
            avatars: true,
            tag_depth: TagDepth::Unlimited,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.domain.is_empty() {
            bail!("domain must not be empty");
        }
        if self.workers == 0 {
            bail!("at least one worker is required");
        }
        Ok(())
    }

    pub fn queue_capacity(&self) -> usize {
        self.workers * QUEUE_SLOTS_PER_WORKER
    }
}

/// Strips a scheme and any path so `https://site.com/questions` becomes `site.com`.
pub fn normalize_domain(input: &str) -> String {
    let trimmed = input.trim();
    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    without_scheme
        .split('/')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}

/// Half the available cores, never fewer than one.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() / 2)
        .unwrap_or(1)
        .max(1)
}

/// Every path a run reads or writes, passed explicitly to the components that need it.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }

    pub fn index_dir(&self) -> PathBuf {
        self.root.join("index")
    }

    pub fn redirect_file(&self) -> PathBuf {
        self.root.join("redirects.tsv")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.output_dir().join("static").join("images")
    }

    pub fn avatars_dir(&self) -> PathBuf {
        self.output_dir().join("static").join("identicon")
    }

    fn page_dirs(&self) -> [PathBuf; 3] {
        let out = self.output_dir();
        [out.join("question"), out.join("tag"), out.join("user")]
    }

    /// True when pages, the index or the redirect table of an earlier run are still around.
    pub fn has_previous_run(&self) -> bool {
        self.page_dirs().iter().any(|p| p.exists())
            || self.index_dir().exists()
            || self.redirect_file().exists()
    }

    /// Removes everything a previous run produced, keeping downloaded images.
    pub fn clean(&self) -> Result<()> {
        for dir in self.page_dirs().iter().chain(std::iter::once(&self.index_dir())) {
            if dir.exists() {
                info!(path = ?dir, "Removing previous output");
                fs::remove_dir_all(dir)
                    .with_context(|| format!("Failed to remove directory: {:?}", dir))?;
            }
        }
        let redirects = self.redirect_file();
        if redirects.exists() {
            info!(path = ?redirects, "Removing previous redirect table");
            fs::remove_file(&redirects)
                .with_context(|| format!("Failed to remove file: {:?}", redirects))?;
        }
        Ok(())
    }

    pub fn prepare(&self) -> Result<()> {
        for dir in [self.output_dir(), self.images_dir(), self.avatars_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory: {:?}", dir))?;
        }
        Ok(())
    }
}

/// The three entity streams of a dump, in the order they must be ingested.
#[derive(Debug, Clone)]
pub struct DumpFiles {
    pub users: PathBuf,
    pub posts: PathBuf,
    pub tags: PathBuf,
}

impl DumpFiles {
    /// Prefers the pre-joined streams (`usersbadges.xml`, `prepare.xml`) over raw exports.
    pub fn locate(dir: &Path) -> Result<Self> {
        Ok(Self {
            users: find_stream(dir, &["usersbadges.xml", "Users.xml"])?,
            posts: find_stream(dir, &["prepare.xml", "Posts.xml"])?,
            tags: find_stream(dir, &["Tags.xml"])?,
        })
    }
}

fn find_stream(dir: &Path, names: &[&str]) -> Result<PathBuf> {
    for name in names {
        for candidate in [dir.join(name), dir.join(format!("{}.bz2", name))] {
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }
    bail!("None of {:?} found in {:?}", names, dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    #[test]
    fn tag_depth_accepts_unlimited_and_multiples() {
        assert_eq!(TagDepth::parse(-1).unwrap(), TagDepth::Unlimited);
        assert_eq!(TagDepth::parse(300).unwrap(), TagDepth::Limited(300));
        assert_eq!(TagDepth::parse(300).unwrap().cap(), Some(300));
        assert_eq!(TagDepth::Unlimited.cap(), None);
    }

    #[test]
    fn tag_depth_rejects_other_values() {
        assert!(TagDepth::parse(0).is_err());
        assert!(TagDepth::parse(-5).is_err());
        assert!(TagDepth::parse(150).is_err());
    }

    #[test]
    fn domain_is_normalized() {
        assert_eq!(normalize_domain("https://Physics.StackExchange.com/"), "physics.stackexchange.com");
        assert_eq!(normalize_domain("http://site.com/questions"), "site.com");
        assert_eq!(normalize_domain("site.com"), "site.com");
    }

    #[test]
    fn validate_rejects_zero_workers() {
        let mut config = SiteConfig::new("site.com");
        config.workers = 0;
        assert!(config.validate().is_err());
        config.workers = 3;
        assert!(config.validate().is_ok());
        assert_eq!(config.queue_capacity(), 6);
    }

    #[test]
    fn workspace_detects_and_cleans_previous_run() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path());
        assert!(!ws.has_previous_run());

        fs::create_dir_all(ws.output_dir().join("question")).unwrap();
        File::create(ws.redirect_file()).unwrap();
        ws.prepare().unwrap();
        assert!(ws.has_previous_run());

        ws.clean().unwrap();
        assert!(!ws.has_previous_run());
        assert!(ws.images_dir().exists());
    }

    #[test]
    fn locate_prefers_prepared_streams() {
        let dir = TempDir::new().unwrap();
        for name in ["Users.xml", "usersbadges.xml", "Posts.xml", "prepare.xml.bz2", "Tags.xml"] {
            File::create(dir.path().join(name)).unwrap();
        }
        let files = DumpFiles::locate(dir.path()).unwrap();
        assert!(files.users.ends_with("usersbadges.xml"));
        assert!(files.posts.ends_with("prepare.xml.bz2"));
        assert!(files.tags.ends_with("Tags.xml"));
    }

    #[test]
    fn locate_fails_without_tags() {
        let dir = TempDir::new().unwrap();
        File::create(dir.path().join("Users.xml")).unwrap();
        File::create(dir.path().join("Posts.xml")).unwrap();
        assert!(DumpFiles::locate(dir.path()).is_err());
    }
}

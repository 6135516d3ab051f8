use crate::content::ContentRewriter;
use crate::images::{fetch_url, ImageCache};
use crate::models::UserProfile;
use crate::render::{Page, Renderer};
use crate::stats::RunStats;
use anyhow::Result;
use std::sync::Arc;
use tracing::debug;

/// Worker-side half of the pipeline: everything that happens to a page after the
/// parser thread hands it over.
pub struct JobRunner {
    rewriter: Arc<ContentRewriter>,
    renderer: Arc<dyn Renderer>,
    avatars: Option<Arc<ImageCache>>,
    user_profiles: bool,
    stats: Arc<RunStats>,
}

impl JobRunner {
    pub fn new(
        rewriter: Arc<ContentRewriter>,
        renderer: Arc<dyn Renderer>,
        avatars: Option<Arc<ImageCache>>,
        user_profiles: bool,
        stats: Arc<RunStats>,
    ) -> Self {
        Self {
            rewriter,
            renderer,
            avatars,
            user_profiles,
            stats,
        }
    }

    pub fn run(&self, page: &mut Page) -> Result<()> {
        match page {
            Page::Question(question) => self.rewriter.rewrite_question(question),
            Page::User(profile) => {
                self.fetch_avatar(profile);
                if !self.user_profiles {
                    return Ok(());
                }
                self.rewriter.rewrite_profile(profile);
            }
            Page::Tag(_) | Page::Home(_) | Page::AllTags(_) => {}
        }
        self.renderer.render(page)?;
        self.stats.inc_rendered();
        Ok(())
    }

    /// Profile pictures are stored as `<id>.png`; a failed fetch only loses the picture.
    fn fetch_avatar(&self, profile: &UserProfile) {
        let (Some(cache), Some(url)) = (&self.avatars, &profile.profile_image_url) else {
            return;
        };
        if url.trim().is_empty() {
            return;
        }
        let filename = format!("{}.png", profile.id);
        if cache.place_as(&fetch_url(url), &filename).is_err() {
            debug!(user_id = profile.id, "Keeping default avatar");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SiteConfig;
    use crate::error::ImageError;
    use crate::images::ImageFetcher;
    use crate::models::{Owner, Question};
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        pages: Mutex<Vec<Page>>,
    }

    impl Renderer for Recorder {
        fn render(&self, page: &Page) -> Result<()> {
            self.pages.lock().unwrap().push(page.clone());
            Ok(())
        }
    }

    struct PngFetcher;

    impl ImageFetcher for PngFetcher {
        fn fetch(&self, _url: &str, dest: &Path) -> Result<(), ImageError> {
            fs::write(dest, b"\x89PNG\r\n\x1a\n")?;
            Ok(())
        }
    }

    fn runner(user_profiles: bool, avatars: Option<Arc<ImageCache>>) -> (JobRunner, Arc<Recorder>) {
        let mut config = SiteConfig::new("site.com");
        config.user_profiles = user_profiles;
        let rewriter = Arc::new(ContentRewriter::new(&config, None).unwrap());
        let recorder = Arc::new(Recorder::default());
        let runner = JobRunner::new(
            rewriter,
            recorder.clone(),
            avatars,
            user_profiles,
            Arc::new(RunStats::new()),
        );
        (runner, recorder)
    }

    fn profile() -> UserProfile {
        UserProfile {
            id: 9,
            display_name: "Grace".into(),
            reputation: 10,
            profile_image_url: Some("https://gravatar.example/9".into()),
            about_me: Some("see https://site.com/q/4".into()),
            badges: BTreeMap::new(),
            path: Some("9/grace".into()),
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn question_bodies_are_rewritten_before_render() {
        let (runner, recorder) = runner(true, None);
        let mut page = Page::Question(Box::new(Question {
            id: 1,
            title: "t".into(),
            score: 0,
            body: r#"<a href="https://site.com/q/4">x</a>"#.into(),
            tags: Vec::new(),
            creation_date: String::new(),
            accepted_answer_id: None,
            owner: Owner::Anonymous,
            comments: Vec::new(),
            answers: Vec::new(),
            related: Vec::new(),
            duplicates: Vec::new(),
            extra: BTreeMap::new(),
        }));
        runner.run(&mut page).unwrap();

        let pages = recorder.pages.lock().unwrap();
        match &pages[0] {
            Page::Question(q) => assert_eq!(q.body, r#"<a href="../element/4">x</a>"#),
            other => panic!("unexpected page {:?}", other),
        }
    }

    #[test]
    fn user_pages_skipped_without_profiles_but_avatar_fetched() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(ImageCache::new(
            dir.path(),
            Arc::new(PngFetcher),
            Arc::new(RunStats::new()),
        ));
        let (runner, recorder) = runner(false, Some(cache));
        runner.run(&mut Page::User(Box::new(profile()))).unwrap();

        assert!(recorder.pages.lock().unwrap().is_empty());
        assert!(dir.path().join("9.png").exists());
    }

    #[test]
    fn user_about_me_wrapped_when_profiles_enabled() {
        let (runner, recorder) = runner(true, None);
        runner.run(&mut Page::User(Box::new(profile()))).unwrap();
        let pages = recorder.pages.lock().unwrap();
        match &pages[0] {
            Page::User(u) => assert_eq!(u.about_me.as_deref(), Some("<p>see https://site.com/q/4</p>")),
            other => panic!("unexpected page {:?}", other),
        }
    }
}

use crate::config::{DumpFiles, SiteConfig, Workspace, COMMIT_INTERVAL, PROGRESS_INTERVAL};
use crate::content::ContentRewriter;
use crate::images::{HttpFetcher, ImageCache, ImageFetcher};
use crate::index::{DumpIndex, Phase};
use crate::jobs::JobRunner;
use crate::markdown::{CommonMark, MarkdownConverter};
use crate::models::Question;
use crate::parser::{DumpReader, FileDumpReader, XmlEvent};
use crate::pool::WorkerPool;
use crate::posts::{Assembled, PostAssembler};
use crate::redirects::{Redirect, RedirectSink};
use crate::render::{JsonRenderer, Page, Renderer};
use crate::resolve::{tag_rows, Resolver};
use crate::stats::{RunStats, StatsSnapshot};
use crate::tags::{all_tags_page, home_page, tag_from_row, tag_pages, TagCollector};
use crate::users::{AssembledUser, UserAssembler};
use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The pieces the pipeline calls out to; swapped for recording fakes in tests.
pub struct Collaborators {
    pub renderer: Arc<dyn Renderer>,
    pub markdown: Arc<dyn MarkdownConverter>,
    pub fetcher: Arc<dyn ImageFetcher>,
}

impl Collaborators {
    /// JSON pages under the workspace output, CommonMark comments, HTTP images.
    pub fn defaults(workspace: &Workspace) -> Self {
        Self {
            renderer: Arc::new(JsonRenderer::new(workspace.output_dir())),
            markdown: Arc::new(CommonMark::new()),
            fetcher: Arc::new(HttpFetcher),
        }
    }
}

/// Runs the three ingestion phases over one dump into one workspace.
pub struct Pipeline {
    config: SiteConfig,
    markdown: Arc<dyn MarkdownConverter>,
    stats: Arc<RunStats>,
    index: DumpIndex,
    redirects: RedirectSink,
    runner: Arc<JobRunner>,
}

impl Pipeline {
    /// Starts a fresh run: empty index, empty redirect table.
    pub fn new(
        config: SiteConfig,
        workspace: &Workspace,
        collaborators: Collaborators,
    ) -> Result<Self> {
        config.validate()?;
        workspace.prepare()?;
        let index = DumpIndex::create(&workspace.index_dir())?;
        let redirects = RedirectSink::create(&workspace.redirect_file())?;
        Self::assemble(config, workspace, collaborators, index, redirects, RunStats::new())
    }

    /// Continues the run recorded in the workspace index. Completed phases are
    /// skipped; an unfinished phase replays its stream, re-rendering every
    /// record but indexing only those past the last commit.
    pub fn resume(
        config: SiteConfig,
        workspace: &Workspace,
        collaborators: Collaborators,
    ) -> Result<Self> {
        config.validate()?;
        workspace.prepare()?;
        let index = DumpIndex::open(&workspace.index_dir())?;
        let manifest = index.manifest();
        let redirects = RedirectSink::resume(&workspace.redirect_file(), manifest.stats.redirects)?;
        let stats = RunStats::from_snapshot(&manifest.completed_stats);
        info!(
            completed = ?manifest.completed,
            phase_records = manifest.phase_records,
            "Resuming previous run"
        );
        Self::assemble(config, workspace, collaborators, index, redirects, stats)
    }

    fn assemble(
        config: SiteConfig,
        workspace: &Workspace,
        collaborators: Collaborators,
        index: DumpIndex,
        redirects: RedirectSink,
        stats: RunStats,
    ) -> Result<Self> {
        let stats = Arc::new(stats);
        let cache = |dir: PathBuf| {
            Arc::new(ImageCache::new(
                dir,
                Arc::clone(&collaborators.fetcher),
                Arc::clone(&stats),
            ))
        };
        let images = config.images.then(|| cache(workspace.images_dir()));
        let avatars = (config.images && config.avatars).then(|| cache(workspace.avatars_dir()));

        let rewriter = Arc::new(ContentRewriter::new(&config, images)?);
        let runner = Arc::new(JobRunner::new(
            rewriter,
            collaborators.renderer,
            avatars,
            config.user_profiles,
            Arc::clone(&stats),
        ));

        info!(
            domain = %config.domain,
            workers = config.workers,
            queue = config.queue_capacity(),
            "Pipeline ready"
        );
        Ok(Self {
            config,
            markdown: collaborators.markdown,
            stats,
            index,
            redirects,
            runner,
        })
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub fn index(&self) -> &DumpIndex {
        &self.index
    }

    /// Users, then Posts, then Tags; a failing phase aborts the run. Phases an
    /// earlier run completed are skipped.
    pub fn run(&mut self, files: &DumpFiles) -> Result<StatsSnapshot> {
        if !self.index.is_complete(Phase::Users) {
            self.ingest_users(FileDumpReader::open(&files.users)?)
                .with_context(|| format!("Users phase failed on {:?}", files.users))?;
        }
        if !self.index.is_complete(Phase::Posts) {
            self.ingest_posts(FileDumpReader::open(&files.posts)?)
                .with_context(|| format!("Posts phase failed on {:?}", files.posts))?;
        }
        if !self.index.is_complete(Phase::Tags) {
            self.ingest_tags(FileDumpReader::open(&files.tags)?)
                .with_context(|| format!("Tags phase failed on {:?}", files.tags))?;
        }
        Ok(self.stats.snapshot())
    }

    fn resolver(&self) -> Resolver {
        Resolver::new(&self.config, Arc::clone(&self.markdown), Arc::clone(&self.stats))
    }

    fn pool(&self, name: &str) -> Result<WorkerPool<Page>> {
        let runner = Arc::clone(&self.runner);
        WorkerPool::new(name, self.config.workers, move |page: &mut Page| runner.run(page))
    }

    fn drain(&self, pool: WorkerPool<Page>) {
        let report = pool.finish();
        if !report.failures.is_empty() {
            warn!(failed = ?report.failures, "Pages not rendered");
        }
        self.stats.add_render_failures(report.failed);
    }

    /// Durability point for the running phase: redirect lines first, so the
    /// manifest never counts lines the table lacks.
    fn checkpoint(&mut self, records: u64) -> Result<()> {
        self.redirects.commit()?;
        self.index.commit(&self.stats, records)
    }

    pub fn ingest_users<R: BufRead>(&mut self, reader: DumpReader<R>) -> Result<()> {
        let committed = self.index.begin(Phase::Users)?;
        let pool = self.pool("users")?;
        let progress = make_spinner("Users");
        let mut assembler = UserAssembler::new(self.resolver());
        let mut count = 0u64;

        for event in reader {
            let event = event.context("Users stream is corrupt")?;
            let user = match assembler.feed(event) {
                Some(AssembledUser::User(user)) => user,
                Some(AssembledUser::Failed { id, error }) => {
                    warn!(user_id = ?id, error = %error, "Skipping malformed user");
                    self.stats.inc_malformed();
                    continue;
                }
                None => continue,
            };

            count += 1;
            let replayed = count <= committed;
            if !replayed {
                self.index.insert_user(user.indexed())?;
            }
            self.stats.inc_users();
            if self.config.user_profiles {
                if !replayed {
                    self.redirects
                        .append_group(&[Redirect::user(user.id, &user.display_name)])?;
                }
                self.stats.add_redirects(1);
            }
            pool.submit(Page::User(user))?;

            if count % COMMIT_INTERVAL == 0 && !replayed {
                self.checkpoint(count)?;
                info!("{} users processed", count);
            }
            if count % PROGRESS_INTERVAL == 0 {
                progress.set_message(format!("Users: {} processed", count));
            }
        }

        ensure_replayed(Phase::Users, count, committed)?;
        self.checkpoint(count)?;
        self.drain(pool);
        self.index.complete(Phase::Users, &self.stats)?;
        progress.finish_with_message(format!("Users: {} processed", count));
        Ok(())
    }

    pub fn ingest_posts<R: BufRead>(&mut self, reader: DumpReader<R>) -> Result<()> {
        let committed = self.index.begin(Phase::Posts)?;
        let pool = self.pool("posts")?;
        let progress = make_spinner("Posts");
        let mut assembler = PostAssembler::new(
            self.resolver(),
            Arc::clone(&self.stats),
            self.config.exclude_unanswered,
        );
        let mut count = 0u64;

        for event in reader {
            let event = event.context("Posts stream is corrupt")?;
            let question = match assembler.feed(&self.index, event) {
                Some(Assembled::Question(question)) => question,
                Some(Assembled::Excluded { id }) => {
                    debug!(question_id = id, "Excluding unanswered question");
                    self.stats.inc_excluded();
                    continue;
                }
                Some(Assembled::Failed { id, error }) => {
                    warn!(question_id = ?id, error = %error, "Skipping malformed question");
                    self.stats.inc_malformed();
                    continue;
                }
                None => continue,
            };

            count += 1;
            let replayed = count <= committed;
            self.record_question(&question, replayed)?;
            pool.submit(Page::Question(question))?;

            if count % COMMIT_INTERVAL == 0 && !replayed {
                self.checkpoint(count)?;
                info!("{} questions processed", count);
            }
            if count % PROGRESS_INTERVAL == 0 {
                progress.set_message(format!("Posts: {} questions processed", count));
            }
        }

        ensure_replayed(Phase::Posts, count, committed)?;
        self.checkpoint(count)?;
        self.drain(pool);
        self.index.complete(Phase::Posts, &self.stats)?;
        info!(redirects = self.redirects.written(), "Redirect table written");
        progress.finish_with_message(format!("Posts: {} questions processed", count));
        Ok(())
    }

    /// Index rows, counters and redirects for one question, before it leaves the
    /// parser thread. A replayed question is already in the index and the table.
    fn record_question(&mut self, question: &Question, replayed: bool) -> Result<()> {
        let rows = tag_rows(question);
        if !replayed {
            self.index.append_tag_rows(&rows)?;
        }
        self.stats.add_tag_rows(rows.len() as u64);

        let comments = question.comments.len()
            + question.answers.iter().map(|a| a.comments.len()).sum::<usize>();
        self.stats.inc_questions();
        self.stats.add_answers(question.answers.len() as u64);
        self.stats.add_comments(comments as u64);

        let mut group: Vec<Redirect> = question
            .answers
            .iter()
            .map(|a| Redirect::answer(a.id, question.id))
            .collect();
        group.push(Redirect::question(question.id));
        if !replayed {
            self.redirects.append_group(&group)?;
        }
        self.stats.add_redirects(group.len() as u64);
        Ok(())
    }

    pub fn ingest_tags<R: BufRead>(&mut self, reader: DumpReader<R>) -> Result<()> {
        self.index.begin(Phase::Tags)?;
        let tag_index = self.index.tag_index()?;
        let progress = make_spinner("Tags");
        let mut tags = TagCollector::new();

        for event in reader {
            let event = event.context("Tags stream is corrupt")?;
            let XmlEvent::Open { name, attrs } = event else {
                continue;
            };
            if name != "row" {
                continue;
            }
            match tag_from_row(&attrs) {
                Ok(Some(tag)) => {
                    if tags.push(tag) {
                        self.stats.inc_tags();
                    }
                }
                Ok(None) => debug!(tag = ?attrs.get("TagName"), "Skipping unused tag"),
                Err(e) => {
                    warn!(tag = ?attrs.get("TagName"), error = %e, "Skipping malformed tag");
                    self.stats.inc_malformed();
                }
            }
        }

        let sorted = tags.into_sorted();
        info!(tags = sorted.len(), indexed = tag_index.tag_count(), "Rendering tag pages");
        progress.set_message(format!("Tags: rendering {} tags", sorted.len()));

        let pool = self.pool("tags")?;
        pool.submit(Page::Home(home_page(&sorted, &tag_index)))?;
        pool.submit(Page::AllTags(all_tags_page(&sorted)))?;
        for tag in &sorted {
            for page in tag_pages(tag, &tag_index, self.config.tag_depth)? {
                pool.submit(Page::Tag(page?))?;
                self.stats.inc_tag_pages();
            }
        }

        self.drain(pool);
        self.index.complete(Phase::Tags, &self.stats)?;
        progress.finish_with_message(format!("Tags: {} tags", sorted.len()));
        Ok(())
    }
}

/// A replay that ends before the committed records means the dump changed under the index.
fn ensure_replayed(phase: Phase, count: u64, committed: u64) -> Result<()> {
    if count < committed {
        bail!(
            "The {} stream ended after {} records, but the index committed {}",
            phase,
            count,
            committed
        );
    }
    Ok(())
}

fn make_spinner(label: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap(),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    pb.set_message(format!("{}: starting", label));
    pb
}

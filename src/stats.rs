use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the run counters, persisted in the index manifest.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub users: u64,
    pub questions: u64,
    pub answers: u64,
    pub comments: u64,
    pub excluded: u64,
    pub malformed: u64,
    pub unresolved_owners: u64,
    pub tag_rows: u64,
    pub redirects: u64,
    pub rendered: u64,
    pub render_failures: u64,
    pub images_fetched: u64,
    pub image_failures: u64,
    pub tags: u64,
    pub tag_pages: u64,
}

/// Counters shared between the parsing thread and the workers
#[derive(Default, Debug)]
pub struct RunStats {
    pub users: AtomicU64,
    pub questions: AtomicU64,
    pub answers: AtomicU64,
    pub comments: AtomicU64,
    pub excluded: AtomicU64,
    pub malformed: AtomicU64,
    pub unresolved_owners: AtomicU64,
    pub tag_rows: AtomicU64,
    pub redirects: AtomicU64,
    pub rendered: AtomicU64,
    pub render_failures: AtomicU64,
    pub images_fetched: AtomicU64,
    pub image_failures: AtomicU64,
    pub tags: AtomicU64,
    pub tag_pages: AtomicU64,
}

fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_users(&self) {
        bump(&self.users, 1);
    }

    pub fn inc_questions(&self) {
        bump(&self.questions, 1);
    }

    pub fn add_answers(&self, count: u64) {
        bump(&self.answers, count);
    }

    pub fn add_comments(&self, count: u64) {
        bump(&self.comments, count);
    }

    pub fn inc_excluded(&self) {
        bump(&self.excluded, 1);
    }

    pub fn inc_malformed(&self) {
        bump(&self.malformed, 1);
    }

    pub fn inc_unresolved(&self) {
        bump(&self.unresolved_owners, 1);
    }

    pub fn add_tag_rows(&self, count: u64) {
        bump(&self.tag_rows, count);
    }

    pub fn add_redirects(&self, count: u64) {
        bump(&self.redirects, count);
    }

    pub fn inc_rendered(&self) {
        bump(&self.rendered, 1);
    }

    pub fn add_render_failures(&self, count: u64) {
        bump(&self.render_failures, count);
    }

    pub fn inc_images_fetched(&self) {
        bump(&self.images_fetched, 1);
    }

    pub fn inc_image_failures(&self) {
        bump(&self.image_failures, 1);
    }

    pub fn inc_tags(&self) {
        bump(&self.tags, 1);
    }

    pub fn inc_tag_pages(&self) {
        bump(&self.tag_pages, 1);
    }

    pub fn questions(&self) -> u64 {
        read(&self.questions)
    }

    pub fn users(&self) -> u64 {
        read(&self.users)
    }

    pub fn malformed(&self) -> u64 {
        read(&self.malformed)
    }

    pub fn render_failures(&self) -> u64 {
        read(&self.render_failures)
    }

    pub fn image_failures(&self) -> u64 {
        read(&self.image_failures)
    }

    /// Restore counters from a manifest written by an earlier run
    pub fn from_snapshot(s: &StatsSnapshot) -> Self {
        Self {
            users: AtomicU64::new(s.users),
            questions: AtomicU64::new(s.questions),
            answers: AtomicU64::new(s.answers),
            comments: AtomicU64::new(s.comments),
            excluded: AtomicU64::new(s.excluded),
            malformed: AtomicU64::new(s.malformed),
            unresolved_owners: AtomicU64::new(s.unresolved_owners),
            tag_rows: AtomicU64::new(s.tag_rows),
            redirects: AtomicU64::new(s.redirects),
            rendered: AtomicU64::new(s.rendered),
            render_failures: AtomicU64::new(s.render_failures),
            images_fetched: AtomicU64::new(s.images_fetched),
            image_failures: AtomicU64::new(s.image_failures),
            tags: AtomicU64::new(s.tags),
            tag_pages: AtomicU64::new(s.tag_pages),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            users: read(&self.users),
            questions: read(&self.questions),
            answers: read(&self.answers),
            comments: read(&self.comments),
            excluded: read(&self.excluded),
            malformed: read(&self.malformed),
            unresolved_owners: read(&self.unresolved_owners),
            tag_rows: read(&self.tag_rows),
            redirects: read(&self.redirects),
            rendered: read(&self.rendered),
            render_failures: read(&self.render_failures),
            images_fetched: read(&self.images_fetched),
            image_failures: read(&self.image_failures),
            tags: read(&self.tags),
            tag_pages: read(&self.tag_pages),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn new_stats_are_zero() {
        assert_eq!(RunStats::new().snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn counters_accumulate() {
        let stats = RunStats::new();
        stats.inc_questions();
        stats.inc_questions();
        stats.add_answers(5);
        stats.add_tag_rows(3);
        stats.inc_malformed();

        let snap = stats.snapshot();
        assert_eq!(snap.questions, 2);
        assert_eq!(snap.answers, 5);
        assert_eq!(snap.tag_rows, 3);
        assert_eq!(stats.malformed(), 1);
    }

    #[test]
    fn concurrent_increments() {
        let stats = Arc::new(RunStats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.inc_rendered();
                        stats.inc_image_failures();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stats.snapshot().rendered, 8000);
        assert_eq!(stats.image_failures(), 8000);
    }

    #[test]
    fn snapshot_roundtrip() {
        let stats = RunStats::new();
        stats.inc_users();
        stats.add_redirects(4);
        stats.add_render_failures(2);
        let restored = RunStats::from_snapshot(&stats.snapshot());
        assert_eq!(restored.snapshot(), stats.snapshot());
        assert_eq!(restored.users(), 1);
        assert_eq!(restored.render_failures(), 2);
    }
}

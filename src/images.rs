use crate::error::ImageError;
use crate::stats::RunStats;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// Downloads one remote image to `dest`.
pub trait ImageFetcher: Send + Sync {
    fn fetch(&self, url: &str, dest: &Path) -> Result<(), ImageError>;
}

/// Blocking HTTP fetcher.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpFetcher;

impl ImageFetcher for HttpFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> Result<(), ImageError> {
        let http_error = |e: ureq::Error| ImageError::Http {
            url: url.to_string(),
            message: e.to_string(),
        };
        let mut response = ureq::get(url).call().map_err(http_error)?;
        let bytes = response.body_mut().read_to_vec().map_err(http_error)?;
        if !looks_like_image(&bytes) {
            return Err(ImageError::NotAnImage {
                url: url.to_string(),
            });
        }

        let tmp = dest.with_extension("part");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, dest)?;
        debug!(url = url, bytes = bytes.len(), "Image downloaded");
        Ok(())
    }
}

/// Checks the leading bytes against the formats browsers render.
pub fn looks_like_image(bytes: &[u8]) -> bool {
    const SIGNATURES: &[&[u8]] = &[
        b"\x89PNG\r\n\x1a\n",
        b"\xff\xd8\xff",
        b"GIF87a",
        b"GIF89a",
        b"BM",
        b"\x00\x00\x01\x00",
    ];
    if SIGNATURES.iter().any(|sig| bytes.starts_with(sig)) {
        return true;
    }
    if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return true;
    }
    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(256)]);
    let head = head.trim_start();
    head.starts_with("<svg") || (head.starts_with("<?xml") && head.contains("<svg"))
}

/// Local file name for an image: SHA-256 of the source plus its extension.
pub fn image_filename(src: &str) -> String {
    let digest = hex::encode(Sha256::digest(src.as_bytes()));
    format!("{}{}", digest, extension(src))
}

/// Extension of the URL path, query string ignored, dot included.
pub fn extension(src: &str) -> &str {
    let path = src.split(['?', '#']).next().unwrap_or(src);
    let file = path.rsplit('/').next().unwrap_or(path);
    match file.rfind('.') {
        Some(pos) if pos > 0 => &file[pos..],
        _ => "",
    }
}

/// URL to request for a `src` attribute; protocol-relative sources go over plain HTTP.
pub fn fetch_url(src: &str) -> String {
    if src.starts_with("//") {
        format!("http:{}", src)
    } else {
        src.to_string()
    }
}

/// Places remote images in one output directory, fetching each at most once
/// even when several workers reference it at the same time.
///
/// Every file name gets one slot. The first caller runs the fetch inside the
/// slot; concurrent callers block on it and all see the same outcome.
pub struct ImageCache {
    dir: PathBuf,
    fetcher: Arc<dyn ImageFetcher>,
    slots: DashMap<String, Arc<OnceLock<bool>>>,
    stats: Arc<RunStats>,
}

impl ImageCache {
    pub fn new(
        dir: impl Into<PathBuf>,
        fetcher: Arc<dyn ImageFetcher>,
        stats: Arc<RunStats>,
    ) -> Self {
        Self {
            dir: dir.into(),
            fetcher,
            slots: DashMap::new(),
            stats,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Fetches an `<img src>` into the cache and returns its local file name.
    pub fn place(&self, src: &str) -> Result<String, ImageError> {
        if extension(src).eq_ignore_ascii_case(".html") {
            return Err(ImageError::NotAnImage {
                url: src.to_string(),
            });
        }
        let filename = image_filename(src);
        self.place_as(&fetch_url(src), &filename)?;
        Ok(filename)
    }

    /// Fetches `url` into `filename` unless it is already there. Returns only
    /// once the file exists or the fetch has failed for every caller.
    pub fn place_as(&self, url: &str, filename: &str) -> Result<(), ImageError> {
        let dest = self.dir.join(filename);
        if dest.exists() {
            return Ok(());
        }

        // The map guard is released before any blocking
        let slot = Arc::clone(&*self.slots.entry(filename.to_string()).or_default());
        let mut own_error = None;
        let fetched = *slot.get_or_init(|| match self.fetch_into(url, &dest) {
            Ok(()) => true,
            Err(e) => {
                own_error = Some(e);
                false
            }
        });

        match (fetched, own_error) {
            (true, _) => Ok(()),
            (false, Some(e)) => Err(e),
            (false, None) => Err(ImageError::AlreadyFailed {
                url: url.to_string(),
            }),
        }
    }

    fn fetch_into(&self, url: &str, dest: &Path) -> Result<(), ImageError> {
        match self.fetcher.fetch(url, dest) {
            Ok(()) => {
                self.stats.inc_images_fetched();
                Ok(())
            }
            Err(e) => {
                warn!(url = url, error = %e, "Image fetch failed");
                self.stats.inc_image_failures();
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n0000";

    struct FakeFetcher {
        calls: AtomicUsize,
        fail: bool,
    }

    impl FakeFetcher {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    impl ImageFetcher for FakeFetcher {
        fn fetch(&self, url: &str, dest: &Path) -> Result<(), ImageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ImageError::Http {
                    url: url.to_string(),
                    message: "404".to_string(),
                });
            }
            fs::write(dest, PNG)?;
            Ok(())
        }
    }

    #[test]
    fn extensions() {
        assert_eq!(extension("https://i.imgur.com/abc.png"), ".png");
        assert_eq!(extension("https://i.imgur.com/abc.JPG?s=128"), ".JPG");
        assert_eq!(extension("https://site.com/img"), "");
        assert_eq!(extension("https://site.com/a.b/img"), "");
        assert_eq!(extension("https://site.com/page.html#x"), ".html");
    }

    #[test]
    fn filename_is_hash_plus_extension() {
        let name = image_filename("https://i.imgur.com/abc.png");
        assert_eq!(name.len(), 64 + 4);
        assert!(name.ends_with(".png"));
        assert_eq!(name, image_filename("https://i.imgur.com/abc.png"));
        assert_ne!(name, image_filename("https://i.imgur.com/abd.png"));
    }

    #[test]
    fn protocol_relative_sources_use_http() {
        assert_eq!(fetch_url("//i.sstatic.net/x.png"), "http://i.sstatic.net/x.png");
        assert_eq!(fetch_url("https://a.com/x.png"), "https://a.com/x.png");
    }

    #[test]
    fn image_signatures() {
        assert!(looks_like_image(PNG));
        assert!(looks_like_image(b"\xff\xd8\xff\xe0rest"));
        assert!(looks_like_image(b"GIF89a...."));
        assert!(looks_like_image(b"RIFF\x00\x00\x00\x00WEBPVP8 "));
        assert!(looks_like_image(b"  <svg xmlns='http://www.w3.org/2000/svg'/>"));
        assert!(!looks_like_image(b"<!DOCTYPE html><html>"));
        assert!(!looks_like_image(b""));
    }

    #[test]
    fn fetches_once_then_reuses_file() {
        let dir = TempDir::new().unwrap();
        let fetcher = FakeFetcher::new(false);
        let stats = Arc::new(RunStats::new());
        let cache = ImageCache::new(dir.path(), fetcher.clone(), Arc::clone(&stats));

        let first = cache.place("https://i.imgur.com/abc.png").unwrap();
        let second = cache.place("https://i.imgur.com/abc.png").unwrap();
        assert_eq!(first, second);
        assert!(dir.path().join(&first).exists());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(stats.snapshot().images_fetched, 1);
    }

    #[test]
    fn html_sources_are_never_fetched() {
        let dir = TempDir::new().unwrap();
        let fetcher = FakeFetcher::new(false);
        let cache = ImageCache::new(dir.path(), fetcher.clone(), Arc::new(RunStats::new()));
        assert!(matches!(
            cache.place("https://site.com/page.html"),
            Err(ImageError::NotAnImage { .. })
        ));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failures_are_remembered() {
        let dir = TempDir::new().unwrap();
        let fetcher = FakeFetcher::new(true);
        let stats = Arc::new(RunStats::new());
        let cache = ImageCache::new(dir.path(), fetcher.clone(), Arc::clone(&stats));

        assert!(matches!(
            cache.place("https://gone.com/x.png"),
            Err(ImageError::Http { .. })
        ));
        assert!(matches!(
            cache.place("https://gone.com/x.png"),
            Err(ImageError::AlreadyFailed { .. })
        ));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(stats.image_failures(), 1);
    }

    #[test]
    fn concurrent_workers_share_first_seen() {
        let dir = TempDir::new().unwrap();
        let fetcher = FakeFetcher::new(false);
        let cache = Arc::new(ImageCache::new(
            dir.path(),
            fetcher.clone(),
            Arc::new(RunStats::new()),
        ));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || cache.place("https://i.imgur.com/shared.gif").unwrap())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    /// Fails only after the gate opens, so a second caller arrives mid-fetch.
    struct GatedFailure {
        calls: AtomicUsize,
        entered: Barrier,
        release: Barrier,
    }

    impl ImageFetcher for GatedFailure {
        fn fetch(&self, url: &str, _dest: &Path) -> Result<(), ImageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.entered.wait();
            self.release.wait();
            Err(ImageError::Http {
                url: url.to_string(),
                message: "503".to_string(),
            })
        }
    }

    #[test]
    fn caller_waiting_on_a_failing_fetch_sees_the_failure() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(GatedFailure {
            calls: AtomicUsize::new(0),
            entered: Barrier::new(2),
            release: Barrier::new(2),
        });
        let cache = ImageCache::new(dir.path(), fetcher.clone(), Arc::new(RunStats::new()));
        let src = "https://img.example/shared.png";

        thread::scope(|s| {
            let first = s.spawn(|| cache.place(src));
            fetcher.entered.wait();
            let second = s.spawn(|| cache.place(src));
            // Give the second caller time to reach the slot before the fetch fails
            thread::sleep(Duration::from_millis(50));
            fetcher.release.wait();

            assert!(matches!(first.join().unwrap(), Err(ImageError::Http { .. })));
            assert!(matches!(
                second.join().unwrap(),
                Err(ImageError::AlreadyFailed { .. })
            ));
        });
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert!(!dir.path().join(image_filename(src)).exists());
    }
}

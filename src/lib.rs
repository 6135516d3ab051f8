//! Stackshelf: Stack Exchange dump to offline site pipeline
//!
//! This crate turns the XML export of one Stack Exchange community into a set of
//! self-contained pages that can be browsed (and packaged) without network access.
//! It runs three strictly ordered passes over the dump:
//!
//! 1. **Users Pass** -- Stream `usersbadges.xml`/`Users.xml`, index every user for
//!    owner lookups, count badges, and render profile pages
//! 2. **Posts Pass** -- Stream `prepare.xml`/`Posts.xml`, assemble each question with
//!    its answers, comments and links, resolve owners, mark the accepted answer,
//!    record question/tag rows, append redirects, and hand the question to the workers
//! 3. **Tags Pass** -- Stream `Tags.xml` and render the home page, the all-tags page,
//!    and the paginated per-tag question listings from the rows of pass 2
//!
//! # Architecture
//!
//! - **Streaming XML parsing** -- One forward-only pass per stream; only the open
//!   question (or user) is held in memory
//! - **Explicit nesting scope** -- A small state machine decides whether a comment
//!   group belongs to the question or to the last answer
//! - **Bounded worker pool** -- Rewriting, image fetching and rendering happen on a
//!   fixed set of threads behind a queue of two jobs per worker, so parsing never
//!   runs ahead of rendering by more than that
//! - **Persistent index** -- Users and question/tag rows live in append-only bincode
//!   journals with a periodically committed manifest; an interrupted run resumes
//!   from its last commit
//! - **External sort** -- Tag rows are sorted in spilled runs and merged on disk
//! - **Concurrent deduplication** -- One `OnceLock` slot per image in a DashMap, so
//!   each image is fetched once across workers
//! - **Atomic operations** -- Lock-free counters for run statistics
//!
//! # Key Modules
//!
//! - [`parser`] -- Streaming XML event reader with BZ2 decompression
//! - [`index`] -- User lookup, question/tag rows, phase ordering
//! - [`store`] -- Append-only journals and atomic snapshots
//! - [`resolve`] -- Owner resolution, field coercion, answer ordering
//! - [`content`] -- Offline link and image rewriting
//! - [`images`] -- Image download and local placement
//! - [`markdown`] -- Comment markup conversion
//! - [`users`], [`posts`], [`tags`] -- Per-stream record assembly
//! - [`pool`] -- Bounded worker pool with sentinel shutdown
//! - [`jobs`] -- Work done for each page on the worker threads
//! - [`render`] -- Page payloads and the default JSON renderer
//! - [`redirects`] -- Tab-separated redirect table
//! - [`pipeline`] -- Wires everything together and runs the passes
//! - [`models`] -- Core data types (Question, Answer, Comment, UserProfile)
//! - [`stats`] -- Thread-safe atomic counters
//! - [`config`] -- Constants, site switches, workspace paths
//! - [`error`] -- Per-record, stream and image errors
//!
//! # Example Usage
//!
//! ```bash
//! # Build the site for a community with 8 render workers
//! stackshelf build dumps/physics --domain physics.stackexchange.com --work work/ --threads 8
//!
//! # Drop pages, index and redirects from an earlier run
//! stackshelf clean --work work/
//! ```

pub mod config;
pub mod content;
pub mod error;
pub mod images;
pub mod index;
pub mod jobs;
pub mod markdown;
pub mod models;
pub mod parser;
pub mod pipeline;
pub mod pool;
pub mod posts;
pub mod redirects;
pub mod render;
pub mod resolve;
pub mod stats;
pub mod store;
pub mod tags;
pub mod users;

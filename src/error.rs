use thiserror::Error;

/// A single record could not be turned into a resolved entity.
///
/// Never fatal: the dispatcher logs it with the record id and moves on.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("missing required attribute `{0}`")]
    MissingField(&'static str),

    #[error("attribute `{field}` is not an integer: {value:?}")]
    NotAnInteger { field: &'static str, value: String },

    #[error("unexpected <{element}> inside {scope}")]
    Misplaced { element: String, scope: &'static str },
}

/// The dump itself is unreadable. Always aborts the current phase.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("malformed XML at byte {position}: {source}")]
    Corruption {
        position: usize,
        #[source]
        source: quick_xml::Error,
    },

    #[error("stream ended with {open} element(s) still open")]
    Truncated { open: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// An image could not be placed in the output tree. The caller substitutes a placeholder.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("HTTP request for {url} failed: {message}")]
    Http { url: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{url} did not return a recognizable image")]
    NotAnImage { url: String },

    #[error("an earlier fetch of {url} already failed")]
    AlreadyFailed { url: String },
}


//! Error types for opening and using database handles.

use thiserror::Error;

use crate::http::BoxError;

/// Failure to open a database handle.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("invalid connection URI `{uri}`: {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("unsupported database codec `{0}` (only UTF-8 is supported)")]
    UnsupportedCodec(String),

    #[error("failed to connect after {attempts} attempt(s): {source}")]
    Failed {
        attempts: u32,
        #[source]
        source: BoxError,
    },

    #[error("{stage} hook failed: {source}")]
    Hook {
        stage: &'static str,
        #[source]
        source: BoxError,
    },
}

/// Failure while running a statement or ending a transaction.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("database handle is closed")]
    Closed,

    #[error("database backend error: {0}")]
    Backend(#[source] BoxError),
}

/// Strips the password from a connection URI for logging.
///
/// `postgres://app:secret@db/app` becomes `postgres://app:***@db/app`; URIs
/// without credentials are returned unchanged.
pub fn redact_uri(uri: &str) -> String {
    let Some((auth, host)) = uri.rsplit_once('@') else {
        return uri.to_string();
    };
    let Some((scheme, credentials)) = auth.split_once("://") else {
        return uri.to_string();
    };
    match credentials.split_once(':') {
        Some((user, _password)) => format!("{scheme}://{user}:***@{host}"),
        None => uri.to_string(),
    }
}

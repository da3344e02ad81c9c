//! Handler failures and their HTTP rendering.

use std::error::Error;
use std::fmt;

use super::{Response, StatusCode};

/// Type-erased error returned by route handlers.
///
/// Any `std::error::Error + Send + Sync` converts into it through `?`, so
/// handlers can propagate database, parse, or I/O errors without wrapping.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// An error that carries the HTTP status and body it should be answered with.
///
/// The router renders an `HttpError` as `status` + `body`; every other handler
/// error becomes a bare `500`. The original failure, if any, stays reachable
/// through [`Error::source`] for logging and upstream inspection.
///
/// # Examples
///
/// ```
/// use std::error::Error;
/// use rttp_dal::http::{HttpError, StatusCode};
///
/// let cause = std::io::Error::other("disk full");
/// let err = HttpError::new(StatusCode::InternalServerError, "Database Error").with_source(cause);
///
/// assert_eq!(err.status(), StatusCode::InternalServerError);
/// assert_eq!(err.body(), "Database Error");
/// assert_eq!(err.source().unwrap().to_string(), "disk full");
/// ```
#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    body: String,
    source: Option<BoxError>,
}

impl HttpError {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            source: None,
        }
    }

    /// Attaches the underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Consumes the error and returns the attached cause, if any.
    pub fn into_source(self) -> Option<BoxError> {
        self.source
    }

    /// Renders the error as a response. The source is never written to the body.
    pub fn to_response(&self) -> Response {
        Response::new(self.status).body(self.body.clone())
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.body)
    }
}

impl Error for HttpError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source
            .as_deref()
            .map(|source| source as &(dyn Error + 'static))
    }
}

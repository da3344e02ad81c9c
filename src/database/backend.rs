//! The seam between the plugin and a database library.
//!
//! [`Backend`] opens handles from an effective [`DalConfig`]; [`Session`] is
//! the part of a handle the plugin drives (commit, rollback, close). Handlers
//! see the concrete handle type and use whatever query API it offers.

use std::future::Future;
use std::sync::Arc;

use super::config::DalConfig;
use super::error::{ConnectionError, DatabaseError};
use crate::http::BoxError;
use crate::router::BoxFuture;

/// Transaction control over an open database handle.
///
/// `commit` and `rollback` end the current transaction, if any; the next
/// statement starts a new one. `close` releases the connection and must leave
/// no transaction committed that was not committed explicitly.
pub trait Session: Send + Sync + 'static {
    fn commit(&self) -> BoxFuture<'_, Result<(), DatabaseError>>;

    fn rollback(&self) -> BoxFuture<'_, Result<(), DatabaseError>>;

    fn close(&self) -> BoxFuture<'_, Result<(), DatabaseError>>;
}

/// Opens database handles.
pub trait Backend: Send + Sync + 'static {
    type Handle: Session;

    /// Opens a handle from every field of `settings`.
    ///
    /// Retrying a failed connection is the backend's business (see
    /// [`DalConfig::attempts`]); callers do not retry.
    fn connect<'a>(
        &'a self,
        settings: &'a DalConfig,
    ) -> BoxFuture<'a, Result<Self::Handle, ConnectionError>>;
}

/// Callback run against a freshly opened handle.
pub type HandleHook<H> =
    Arc<dyn Fn(Arc<H>) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync + 'static>;

/// Boxes an async closure into a [`HandleHook`].
pub fn hook<H, F, Fut, E>(f: F) -> HandleHook<H>
where
    H: Send + Sync + 'static,
    F: Fn(Arc<H>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<BoxError>,
{
    Arc::new(move |handle: Arc<H>| -> BoxFuture<'static, Result<(), BoxError>> {
        let fut = f(handle);
        Box::pin(async move { fut.await.map_err(Into::into) })
    })
}

/// Callbacks that prepare a new handle before a handler sees it.
pub struct Hooks<H> {
    /// Runs right after the connection opens.
    pub after_connection: Option<HandleHook<H>>,
    /// Defines (and, if configured, migrates) tables.
    pub define_tables: Option<HandleHook<H>>,
}

impl<H> Default for Hooks<H> {
    fn default() -> Self {
        Self {
            after_connection: None,
            define_tables: None,
        }
    }
}

impl<H> Clone for Hooks<H> {
    fn clone(&self) -> Self {
        Self {
            after_connection: self.after_connection.clone(),
            define_tables: self.define_tables.clone(),
        }
    }
}

impl<H: Send + Sync + 'static> Hooks<H> {
    /// Runs `after_connection` then `define_tables` on `handle`.
    pub async fn prepare(&self, handle: &Arc<H>) -> Result<(), ConnectionError> {
        if let Some(after) = &self.after_connection {
            after(Arc::clone(handle))
                .await
                .map_err(|source| ConnectionError::Hook {
                    stage: "after_connection",
                    source,
                })?;
        }
        if let Some(define) = &self.define_tables {
            define(Arc::clone(handle))
                .await
                .map_err(|source| ConnectionError::Hook {
                    stage: "define_tables",
                    source,
                })?;
        }
        Ok(())
    }
}

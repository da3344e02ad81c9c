//! Database layer: the DAL plugin and the handles it injects.
//!
//! - [`config`]: instance configuration, per-route overrides, file/env loading
//! - [`backend`]: the [`Backend`] / [`Session`] seam and connection hooks
//! - [`sql`]: the sqlx-backed [`SqlBackend`] and [`SqlHandle`]
//! - [`plugin`]: [`DalPlugin`], which wraps routes that declare its keyword

pub mod backend;
pub mod config;
pub mod error;
pub mod plugin;
pub mod sql;

pub use backend::{Backend, HandleHook, Hooks, Session, hook};
pub use config::{ConfigError, DEFAULT_KEYWORD, DalConfig, DalOverrides, SECTION};
pub use error::{ConnectionError, DatabaseError};
pub use plugin::{DalPlugin, FAILURE_BODY, PLUGIN_NAME};
pub use sql::{Row, SqlBackend, SqlHandle, Value};

//! # rttp-dal
//!
//! Per-request database handles for rttp routes.
//!
//! [`DalPlugin`] is installed on a [`Router`]. Every route that declares the
//! plugin keyword (`"db"` unless configured otherwise) gets a database handle
//! injected into its [`Context`]; the plugin commits on success when
//! `autocommit` is on, rolls back on failure, and turns any failure into
//! `500 Database Error`. Routes that do not declare the keyword are never
//! wrapped and never connect.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rttp_dal::{BoxError, Context, DalConfig, DalPlugin, Response, RouteConfig, Router, StatusCode};
//! use rttp_dal::database::{SqlHandle, Value};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), BoxError> {
//!     let config = DalConfig::load("dal.toml")?;
//!     let plugin = DalPlugin::new(config).define_tables(|db: Arc<SqlHandle>| async move {
//!         db.execute("CREATE TABLE IF NOT EXISTS person (name TEXT NOT NULL)", &[]).await?;
//!         db.commit().await
//!     });
//!
//!     let mut router = Router::new();
//!     router.install(plugin).await?;
//!
//!     router.post_with("/people/:name", RouteConfig::new().needs("db"), |ctx: Context| async move {
//!         let db = ctx.injected::<SqlHandle>("db").ok_or("no database handle")?;
//!         let name = ctx.params().get("name").unwrap_or_default().to_string();
//!         db.execute("INSERT INTO person (name) VALUES (?)", &[Value::from(name)]).await?;
//!         db.commit().await?;
//!         Ok::<_, BoxError>(Response::new(StatusCode::Created))
//!     });
//!     Ok(())
//! }
//! ```

pub mod context;
pub mod database;
pub mod http;
pub mod plugin;
pub mod router;

pub use context::{Context, PathParams};
pub use database::{DalConfig, DalOverrides, DalPlugin};
pub use http::{BoxError, Headers, HttpError, Method, Request, Response, StatusCode};
pub use plugin::{Plugin, PluginError, RouteInfo};
pub use router::{BoxFuture, Handler, HandlerResult, IntoHandler, RouteConfig, Router};

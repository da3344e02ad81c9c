//! The DAL plugin: injects a database handle into routes that ask for one.
//!
//! At registration the plugin resolves a route's effective [`DalConfig`] and
//! checks whether the route declares the configured keyword. Routes that do
//! not are left alone and never touch the database. Routes that do are
//! wrapped so that every request:
//!
//! 1. gets a handle (a fresh one, or the plugin's shared one in pooled mode),
//! 2. sees it in its [`Context`] under the keyword,
//! 3. commits on success when `autocommit` is on,
//! 4. rolls back on failure and answers `500 Database Error`,
//! 5. closes the handle it opened.

use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

use super::backend::{Backend, Hooks, Session, hook};
use super::config::{DalConfig, DalOverrides, SECTION};
use super::error::{ConnectionError, redact_uri};
use super::sql::SqlBackend;
use crate::context::Context;
use crate::http::{BoxError, HttpError};
use crate::plugin::{Plugin, PluginError, RouteInfo, find_keyword_owner};
use crate::router::{BoxFuture, Handler, HandlerResult};
use crate::StatusCode;

/// Name the plugin reports in logs and conflict errors.
pub const PLUGIN_NAME: &str = "dal";

/// Body of the response sent when a database-backed request fails.
pub const FAILURE_BODY: &str = "Database Error";

/// Binds a database handle to every route that declares the plugin keyword.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use rttp_dal::{Context, DalConfig, DalPlugin, Response, RouteConfig, Router, StatusCode};
/// use rttp_dal::database::SqlHandle;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
/// let plugin = DalPlugin::new(DalConfig {
///     autocommit: true,
///     ..DalConfig::default()
/// })
/// .define_tables(|db: Arc<SqlHandle>| async move {
///     db.execute("CREATE TABLE IF NOT EXISTS person (name TEXT)", &[]).await?;
///     db.commit().await
/// });
///
/// let mut router = Router::new();
/// router.install(plugin).await?;
/// router.get_with("/people", RouteConfig::new().needs("db"), |ctx: Context| async move {
///     let db = ctx.injected::<SqlHandle>("db").ok_or("no database handle")?;
///     let count = db.scalar("SELECT COUNT(*) FROM person", &[]).await?;
///     Ok::<_, rttp_dal::BoxError>(
///         Response::new(StatusCode::Ok).body(count.as_i64().unwrap_or(0).to_string()),
///     )
/// });
/// # Ok(())
/// # }
/// ```
pub struct DalPlugin<B: Backend = SqlBackend> {
    config: DalConfig,
    backend: Arc<B>,
    hooks: Hooks<B::Handle>,
    shared: Arc<OnceCell<Arc<B::Handle>>>,
}

impl DalPlugin<SqlBackend> {
    /// Creates a plugin backed by sqlx.
    pub fn new(config: DalConfig) -> Self {
        Self::with_backend(SqlBackend::new(), config)
    }
}

impl<B: Backend> DalPlugin<B> {
    pub fn with_backend(backend: B, config: DalConfig) -> Self {
        Self {
            config,
            backend: Arc::new(backend),
            hooks: Hooks::default(),
            shared: Arc::new(OnceCell::new()),
        }
    }

    /// Sets the callback that defines tables on each newly opened handle.
    #[must_use]
    pub fn define_tables<F, Fut, E>(mut self, f: F) -> Self
    where
        F: Fn(Arc<B::Handle>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.hooks.define_tables = Some(hook(f));
        self
    }

    /// Sets the callback run right after a handle connects, before `define_tables`.
    #[must_use]
    pub fn after_connection<F, Fut, E>(mut self, f: F) -> Self
    where
        F: Fn(Arc<B::Handle>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.hooks.after_connection = Some(hook(f));
        self
    }

    /// Supplies the shared handle used in pooled mode instead of opening one.
    ///
    /// The handle is used as is; no hooks run against it.
    #[must_use]
    pub fn with_shared_handle(mut self, handle: Arc<B::Handle>) -> Self {
        self.shared = Arc::new(OnceCell::new_with(Some(handle)));
        self
    }

    /// The instance configuration every route starts from.
    pub fn config(&self) -> &DalConfig {
        &self.config
    }

    fn effective_config(&self, route: &RouteInfo<'_>) -> DalConfig {
        match route.config.section::<DalOverrides>(SECTION) {
            Some(overrides) => self.config.overlay(overrides),
            None => self.config.clone(),
        }
    }

    // Name of another installed plugin that already injects under `keyword`.
    fn foreign_owner<'r>(&self, route: &RouteInfo<'r>, keyword: &str) -> Option<&'r str> {
        route
            .plugins
            .iter()
            .filter(|p| !std::ptr::addr_eq(Arc::as_ptr(*p), self as *const Self))
            .find(|p| p.keyword() == Some(keyword))
            .map(|p| p.name())
    }

    fn lifecycle(&self, settings: DalConfig) -> RequestLifecycle<B> {
        // Only routes that still target the instance database may borrow its shared handle.
        let reuse_shared =
            self.config.pooled() && settings.pooled() && settings.uri == self.config.uri;
        RequestLifecycle {
            backend: Arc::clone(&self.backend),
            hooks: self.hooks.clone(),
            shared: Arc::clone(&self.shared),
            instance: self.config.clone(),
            settings,
            reuse_shared,
        }
    }
}

impl<B: Backend> fmt::Debug for DalPlugin<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DalPlugin")
            .field("uri", &redact_uri(&self.config.uri))
            .field("keyword", &self.config.keyword)
            .field("pooled", &self.config.pooled())
            .field("shared_open", &self.shared.initialized())
            .finish()
    }
}

impl<B: Backend> Plugin for DalPlugin<B> {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn keyword(&self) -> Option<&str> {
        Some(&self.config.keyword)
    }

    fn setup<'a>(
        &'a self,
        installed: &'a [Arc<dyn Plugin>],
    ) -> BoxFuture<'a, Result<(), PluginError>> {
        Box::pin(async move {
            self.config.validate().map_err(|e| PluginError::Startup {
                plugin: PLUGIN_NAME.to_string(),
                source: Box::new(e),
            })?;

            if let Some(other) = find_keyword_owner(installed, &self.config.keyword) {
                return Err(PluginError::ConfigurationConflict {
                    keyword: self.config.keyword.clone(),
                    plugin: other.name().to_string(),
                });
            }

            if self.config.pooled() {
                self.shared
                    .get_or_try_init(|| open_handle(&*self.backend, &self.hooks, &self.config))
                    .await
                    .map_err(|e| PluginError::Startup {
                        plugin: PLUGIN_NAME.to_string(),
                        source: Box::new(e),
                    })?;
                info!(
                    uri = %redact_uri(&self.config.uri),
                    pool_size = self.config.pool_size,
                    "shared database handle ready"
                );
            }
            Ok(())
        })
    }

    fn apply(&self, handler: Handler, route: &RouteInfo<'_>) -> Handler {
        let settings = self.effective_config(route);
        if !route.config.declares(&settings.keyword) {
            debug!(
                method = %route.method,
                path = route.path,
                keyword = %settings.keyword,
                "route does not use the database, left unwrapped"
            );
            return handler;
        }

        if let Some(owner) = self.foreign_owner(route, &settings.keyword) {
            error!(
                method = %route.method,
                path = route.path,
                keyword = %settings.keyword,
                plugin = owner,
                "route keyword override collides with another plugin, requests will fail"
            );
            return conflict_handler(settings.keyword, owner.to_string());
        }

        debug!(
            method = %route.method,
            path = route.path,
            keyword = %settings.keyword,
            autocommit = settings.autocommit,
            "route wrapped with database handle"
        );
        let lifecycle = Arc::new(self.lifecycle(settings));
        Arc::new(move |ctx: Context| -> BoxFuture<'static, HandlerResult> {
            let handler = Arc::clone(&handler);
            let lifecycle = Arc::clone(&lifecycle);
            Box::pin(async move { lifecycle.run(handler, ctx).await })
        })
    }
}

// Everything one wrapped route needs per request, resolved at registration.
struct RequestLifecycle<B: Backend> {
    backend: Arc<B>,
    hooks: Hooks<B::Handle>,
    shared: Arc<OnceCell<Arc<B::Handle>>>,
    instance: DalConfig,
    settings: DalConfig,
    reuse_shared: bool,
}

impl<B: Backend> RequestLifecycle<B> {
    async fn run(&self, handler: Handler, mut ctx: Context) -> HandlerResult {
        let (handle, owned) = match self.acquire().await {
            Ok(acquired) => acquired,
            Err(e) => return Err(self.fail(Box::new(e))),
        };

        ctx.inject(self.settings.keyword.clone(), Arc::clone(&handle));

        let outcome = match handler(ctx).await {
            Ok(response) if self.settings.autocommit => match handle.commit().await {
                Ok(()) => Ok(response),
                Err(e) => Err(BoxError::from(e)),
            },
            other => other,
        };

        let result = match outcome {
            Ok(response) => Ok(response),
            Err(e) => {
                if let Err(rollback) = handle.rollback().await {
                    warn!(error = %rollback, "rollback after failed request also failed");
                }
                Err(self.fail(e))
            }
        };

        if owned {
            if let Err(e) = handle.close().await {
                warn!(error = %e, "failed to close database handle");
            } else {
                debug!("database handle closed");
            }
        }
        result
    }

    // Returns the handle and whether this request owns (and must close) it.
    async fn acquire(&self) -> Result<(Arc<B::Handle>, bool), ConnectionError> {
        if self.reuse_shared {
            let handle = self
                .shared
                .get_or_try_init(|| open_handle(&*self.backend, &self.hooks, &self.instance))
                .await?;
            return Ok((Arc::clone(handle), false));
        }
        let handle = open_handle(&*self.backend, &self.hooks, &self.settings).await?;
        Ok((handle, true))
    }

    fn fail(&self, cause: BoxError) -> BoxError {
        error!(
            keyword = %self.settings.keyword,
            error = %error_chain(&*cause),
            "database request failed, rolled back"
        );
        Box::new(HttpError::new(StatusCode::InternalServerError, FAILURE_BODY).with_source(cause))
    }
}

// Serves a route whose keyword another plugin owns: every request fails without
// touching the database.
fn conflict_handler(keyword: String, plugin: String) -> Handler {
    Arc::new(move |_ctx: Context| -> BoxFuture<'static, HandlerResult> {
        let conflict = PluginError::ConfigurationConflict {
            keyword: keyword.clone(),
            plugin: plugin.clone(),
        };
        Box::pin(async move {
            let err = HttpError::new(StatusCode::InternalServerError, FAILURE_BODY)
                .with_source(conflict);
            Err(Box::new(err) as BoxError)
        })
    })
}

async fn open_handle<B: Backend>(
    backend: &B,
    hooks: &Hooks<B::Handle>,
    settings: &DalConfig,
) -> Result<Arc<B::Handle>, ConnectionError> {
    let handle = Arc::new(backend.connect(settings).await?);
    if let Err(e) = hooks.prepare(&handle).await {
        if let Err(close) = handle.close().await {
            warn!(error = %close, "failed to close handle after hook failure");
        }
        return Err(e);
    }
    Ok(handle)
}

fn error_chain(err: &(dyn Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

//! Request routing with a registration-time plugin stack.
//!
//! [`Router`] maps a method and a URL pattern to a handler. Three pattern styles
//! are supported:
//!
//! | Pattern              | Example match              | Captured params              |
//! |----------------------|----------------------------|------------------------------|
//! | `/users`             | `/users`                   | *(none)*                     |
//! | `/users/:id`         | `/users/42`                | `id → "42"`                  |
//! | `/files/*`           | `/files/docs/readme.txt`   | `wildcard → "/docs/readme.txt"` |
//!
//! Every route carries a [`RouteConfig`]: the injection keywords its handler
//! declares it needs, plus typed configuration sections that plugins read.
//! Installed [`Plugin`]s are applied to a route when it is registered (and
//! again for every route when a new plugin is installed), so the decision of
//! whether a handler gets wrapped is made once, never per request.

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, error};

use crate::context::{Context, PathParams};
use crate::http::{BoxError, HttpError};
use crate::plugin::{Plugin, PluginError, RouteInfo};
use crate::{Method, Request, Response, StatusCode};

/// A boxed, `Send` future: the return type of every handler and plugin hook.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What a handler resolves to: a response, or an error for the router to render.
pub type HandlerResult = Result<Response, BoxError>;

/// Type-erased async handler. Plugins receive and return this type.
pub type Handler =
    Arc<dyn Fn(Context) -> BoxFuture<'static, HandlerResult> + Send + Sync + 'static>;

/// Anything a handler may resolve to.
///
/// Implemented for a plain [`Response`] and for `Result<Response, E>` with any
/// error convertible into [`BoxError`], so handlers can use `?` freely.
pub trait IntoHandlerResult: Send + 'static {
    fn into_handler_result(self) -> HandlerResult;
}

impl IntoHandlerResult for Response {
    fn into_handler_result(self) -> HandlerResult {
        Ok(self)
    }
}

impl<E> IntoHandlerResult for Result<Response, E>
where
    E: Into<BoxError> + Send + 'static,
{
    fn into_handler_result(self) -> HandlerResult {
        self.map_err(Into::into)
    }
}

/// Conversion trait for async handler functions.
///
/// Any `Fn(Context) -> impl Future<Output = R> + Send` where `R` implements
/// [`IntoHandlerResult`] qualifies through the blanket impl below.
pub trait IntoHandler: Send + Sync + 'static {
    fn call(&self, ctx: Context) -> BoxFuture<'static, HandlerResult>;
}

impl<T, F, R> IntoHandler for T
where
    T: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = R> + Send + 'static,
    R: IntoHandlerResult,
{
    fn call(&self, ctx: Context) -> BoxFuture<'static, HandlerResult> {
        let fut = (self)(ctx);
        Box::pin(async move { fut.await.into_handler_result() })
    }
}

/// Per-route declarations consumed by plugins at registration time.
///
/// # Examples
///
/// ```
/// use rttp_dal::RouteConfig;
///
/// let config = RouteConfig::new().needs("db").with_section("cache", 30_u32);
///
/// assert!(config.declares("db"));
/// assert!(!config.declares("session"));
/// assert_eq!(config.section::<u32>("cache"), Some(&30));
/// ```
#[derive(Default)]
pub struct RouteConfig {
    needs: BTreeSet<String>,
    sections: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl RouteConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares that the handler expects a value injected under `keyword`.
    #[must_use]
    pub fn needs(mut self, keyword: impl Into<String>) -> Self {
        self.needs.insert(keyword.into());
        self
    }

    /// Attaches a typed configuration section under `key`, replacing any previous one.
    #[must_use]
    pub fn with_section<T>(mut self, key: impl Into<String>, value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.sections.insert(key.into(), Box::new(value));
        self
    }

    pub fn declares(&self, keyword: &str) -> bool {
        self.needs.contains(keyword)
    }

    /// Returns the section stored under `key` if it has type `T`.
    pub fn section<T>(&self, key: &str) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.sections
            .get(key)
            .and_then(|value| value.downcast_ref::<T>())
    }
}

impl fmt::Debug for RouteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteConfig")
            .field("needs", &self.needs)
            .field("sections", &self.sections.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug, Clone)]
enum Segment {
    Static(String),
    Parameter(String),
}

// Compiled representation of a route pattern string.
#[derive(Debug, Clone)]
enum Pattern {
    Exact(String),
    Parameterized(Vec<Segment>),
    Wildcard(String),
}

fn trim_trailing_slash(path: &str) -> &str {
    match path.strip_suffix('/') {
        Some(trimmed) if !trimmed.is_empty() => trimmed,
        _ => path,
    }
}

impl Pattern {
    /// `/*` suffix → wildcard, any `:` → parameterized, otherwise exact.
    /// A trailing slash other than the root is ignored.
    fn parse(pattern: &str) -> Self {
        let pattern = trim_trailing_slash(pattern);

        if let Some(prefix) = pattern.strip_suffix("/*") {
            return Pattern::Wildcard(prefix.to_string());
        }

        if pattern.contains(':') {
            let segments = pattern
                .split('/')
                .filter(|s| !s.is_empty())
                .map(|s| match s.strip_prefix(':') {
                    Some(name) => Segment::Parameter(name.to_string()),
                    None => Segment::Static(s.to_string()),
                })
                .collect();
            return Pattern::Parameterized(segments);
        }

        Pattern::Exact(pattern.to_string())
    }

    fn matches(&self, path: &str) -> Option<PathParams> {
        let path = trim_trailing_slash(path);

        match self {
            Pattern::Exact(p) => (p == path).then(PathParams::new),
            Pattern::Parameterized(segments) => {
                let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
                if parts.len() != segments.len() {
                    return None;
                }

                let mut params = PathParams::new();
                for (segment, part) in segments.iter().zip(parts) {
                    match segment {
                        Segment::Static(s) if s != part => return None,
                        Segment::Static(_) => {}
                        Segment::Parameter(name) => params.insert(name.clone(), part.to_string()),
                    }
                }
                Some(params)
            }
            Pattern::Wildcard(prefix) => path.strip_prefix(prefix.as_str()).map(|suffix| {
                let mut params = PathParams::new();
                params.insert("wildcard".to_string(), suffix.to_string());
                params
            }),
        }
    }
}

// A registered route. `callback` is what the user registered; `handler` is the
// callback after the plugin stack was applied.
struct Route {
    method: Method,
    path: String,
    pattern: Pattern,
    config: RouteConfig,
    callback: Handler,
    handler: Handler,
}

impl Route {
    fn matches(&self, method: &Method, path: &str) -> Option<PathParams> {
        if &self.method == method {
            self.pattern.matches(path)
        } else {
            None
        }
    }

    fn rewrap(&mut self, plugins: &[Arc<dyn Plugin>]) {
        let info = RouteInfo {
            method: &self.method,
            path: &self.path,
            config: &self.config,
            plugins,
        };
        // Reverse install order: the first plugin installed ends up outermost.
        self.handler = plugins
            .iter()
            .rev()
            .fold(Arc::clone(&self.callback), |handler, plugin| {
                plugin.apply(handler, &info)
            });
    }
}

/// HTTP request router with an installed plugin stack.
///
/// # Examples
///
/// ```
/// use rttp_dal::{Context, Response, RouteConfig, Router, StatusCode};
///
/// let mut router = Router::new();
/// router.get("/ping", |_ctx: Context| async { Response::new(StatusCode::Ok) });
/// router.get_with("/people", RouteConfig::new().needs("db"), |_ctx: Context| async {
///     Response::new(StatusCode::Ok)
/// });
/// assert_eq!(router.len(), 2);
/// ```
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
    plugins: Vec<Arc<dyn Plugin>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a plugin.
    ///
    /// Runs [`Plugin::setup`] against the plugins already installed. On success
    /// the plugin joins the stack and every registered route is re-wrapped; on
    /// failure nothing changes and no route is wrapped by it.
    ///
    /// # Errors
    ///
    /// Whatever [`Plugin::setup`] returns, e.g.
    /// [`PluginError::ConfigurationConflict`] for a keyword already claimed.
    pub async fn install<P>(&mut self, plugin: P) -> Result<(), PluginError>
    where
        P: Plugin,
    {
        let plugin: Arc<dyn Plugin> = Arc::new(plugin);
        plugin.setup(&self.plugins).await?;
        debug!(plugin = plugin.name(), routes = self.routes.len(), "plugin installed");

        self.plugins.push(plugin);
        for route in &mut self.routes {
            route.rewrap(&self.plugins);
        }
        Ok(())
    }

    /// Returns the installed plugins in install order.
    pub fn plugins(&self) -> &[Arc<dyn Plugin>] {
        &self.plugins
    }

    pub fn get(&mut self, path: &str, handler: impl IntoHandler) {
        self.add(Method::Get, path, RouteConfig::default(), handler);
    }

    pub fn post(&mut self, path: &str, handler: impl IntoHandler) {
        self.add(Method::Post, path, RouteConfig::default(), handler);
    }

    pub fn put(&mut self, path: &str, handler: impl IntoHandler) {
        self.add(Method::Put, path, RouteConfig::default(), handler);
    }

    pub fn delete(&mut self, path: &str, handler: impl IntoHandler) {
        self.add(Method::Delete, path, RouteConfig::default(), handler);
    }

    pub fn get_with(&mut self, path: &str, config: RouteConfig, handler: impl IntoHandler) {
        self.add(Method::Get, path, config, handler);
    }

    pub fn post_with(&mut self, path: &str, config: RouteConfig, handler: impl IntoHandler) {
        self.add(Method::Post, path, config, handler);
    }

    pub fn put_with(&mut self, path: &str, config: RouteConfig, handler: impl IntoHandler) {
        self.add(Method::Put, path, config, handler);
    }

    pub fn delete_with(&mut self, path: &str, config: RouteConfig, handler: impl IntoHandler) {
        self.add(Method::Delete, path, config, handler);
    }

    /// Registers a route and applies the installed plugins to it.
    pub fn add(
        &mut self,
        method: Method,
        path: &str,
        config: RouteConfig,
        handler: impl IntoHandler,
    ) {
        let callback: Handler = Arc::new(move |ctx| handler.call(ctx));
        let mut route = Route {
            method,
            path: path.to_string(),
            pattern: Pattern::parse(path),
            config,
            handler: Arc::clone(&callback),
            callback,
        };
        route.rewrap(&self.plugins);
        self.routes.push(route);
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Dispatches `request` to the first matching route and returns its response.
    ///
    /// A handler error is rendered here: an [`HttpError`] becomes its own status
    /// and body, anything else becomes `500 Internal Server Error`. No matching
    /// route yields `404 Not Found`.
    pub async fn route(&self, request: Request) -> Response {
        let path = request.path().to_string();

        for route in &self.routes {
            if let Some(params) = route.matches(request.method(), &path) {
                let ctx = Context::with_params(request, params);
                return match (route.handler)(ctx).await {
                    Ok(response) => response,
                    Err(err) => render_error(&route.method, &path, err),
                };
            }
        }

        Response::new(StatusCode::NotFound)
    }
}

fn render_error(method: &Method, path: &str, err: BoxError) -> Response {
    match err.downcast::<HttpError>() {
        Ok(http) => {
            debug!(%method, path, status = %http.status(), "handler returned HTTP error");
            http.to_response()
        }
        Err(other) => {
            error!(%method, path, error = %other, "unhandled handler error");
            Response::new(StatusCode::InternalServerError)
                .body(StatusCode::InternalServerError.canonical_reason())
        }
    }
}

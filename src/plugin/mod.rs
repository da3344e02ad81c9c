//! Plugin protocol: registration-time decoration of route handlers.
//!
//! A plugin is installed once on a [`Router`](crate::Router) and then sees
//! every route twice over its lifetime:
//!
//! 1. [`Plugin::setup`] runs once, at install time, with the plugins already
//!    installed. It may reject the installation (for example when another
//!    plugin already claims the same injection keyword) or open long-lived
//!    resources.
//! 2. [`Plugin::apply`] runs once per route, at registration time, and
//!    returns the handler that will actually serve the route: either the
//!    original one untouched or a wrapper around it.
//!
//! Nothing here runs per request; per-request work happens inside the
//! wrappers that `apply` returns.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::Method;
use crate::http::BoxError;
use crate::router::{BoxFuture, Handler, RouteConfig};

/// Errors raised while installing a plugin. Both are fatal for start-up.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error(
        "found another plugin (`{plugin}`) with conflicting settings (non-unique keyword `{keyword}`)"
    )]
    ConfigurationConflict { keyword: String, plugin: String },

    #[error("plugin `{plugin}` failed to start: {source}")]
    Startup {
        plugin: String,
        #[source]
        source: BoxError,
    },
}

/// What a plugin may inspect about the route it is wrapping.
#[derive(Clone, Copy)]
pub struct RouteInfo<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    pub config: &'a RouteConfig,
    /// Every installed plugin, the one being applied included.
    pub plugins: &'a [Arc<dyn Plugin>],
}

impl fmt::Debug for RouteInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteInfo")
            .field("method", self.method)
            .field("path", &self.path)
            .field("config", self.config)
            .field("plugins", &self.plugins.iter().map(|p| p.name()).collect::<Vec<_>>())
            .finish()
    }
}

/// The core trait for all router plugins.
///
/// # Contract
///
/// - `apply` is called at registration time, never per request. A plugin that
///   has nothing to do for a route must return the handler it was given.
/// - Plugins are shared across Tokio tasks and must be `Send + Sync`.
/// - `keyword` names the context key a plugin injects into. Two installed
///   plugins must never claim the same keyword.
pub trait Plugin: Send + Sync + 'static {
    /// Short identifier used in logs and conflict errors.
    fn name(&self) -> &str;

    /// The context keyword this plugin injects under, if any.
    fn keyword(&self) -> Option<&str> {
        None
    }

    /// Validates the plugin against the ones already installed and acquires
    /// any start-up resources.
    fn setup<'a>(
        &'a self,
        installed: &'a [Arc<dyn Plugin>],
    ) -> BoxFuture<'a, Result<(), PluginError>> {
        let _ = installed;
        Box::pin(async { Ok(()) })
    }

    /// Decorates `handler` for the given route.
    fn apply(&self, handler: Handler, route: &RouteInfo<'_>) -> Handler;
}

/// Returns the first installed plugin that claims `keyword`.
pub fn find_keyword_owner<'a>(
    installed: &'a [Arc<dyn Plugin>],
    keyword: &str,
) -> Option<&'a Arc<dyn Plugin>> {
    installed.iter().find(|p| p.keyword() == Some(keyword))
}

//! Plugin configuration: instance defaults, route overrides, and loading.
//!
//! [`DalConfig`] is built once per plugin instance. A route may shadow any of
//! its fields with a [`DalOverrides`] section; [`DalConfig::overlay`] merges the
//! two into the route's effective configuration without touching the instance
//! value.
//!
//! Loading uses Figment with this merge order (later overrides earlier):
//! 1. Compiled defaults
//! 2. A TOML file
//! 3. `DAL_*` environment variables (`DAL_URI`, `DAL_AUTOCOMMIT`, …)

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Route configuration section key holding a route's [`DalOverrides`].
pub const SECTION: &str = "db";

/// Default injection keyword.
pub const DEFAULT_KEYWORD: &str = "db";

/// Errors produced while loading or validating a [`DalConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load database configuration: {0}")]
    Load(#[source] Box<figment::Error>),

    #[error("invalid database configuration `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Options controlling how database handles are opened and how requests end.
///
/// Every field has a default, so a TOML file only needs the keys it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DalConfig {
    /// Connection URL understood by the backend.
    pub uri: String,
    /// Commit after every successful handler call.
    pub autocommit: bool,
    /// `0` opens a handle per request; anything else shares one handle per plugin.
    pub pool_size: u32,
    /// Base directory for relative SQLite database files.
    pub folder: Option<PathBuf>,
    pub db_codec: String,
    pub check_reserved: Option<Vec<String>>,
    pub migrate: bool,
    pub fake_migrate: bool,
    pub migrate_enabled: bool,
    pub fake_migrate_all: bool,
    pub decode_credentials: bool,
    /// Extra driver options, appended to the URI as query parameters.
    pub driver_args: Option<BTreeMap<String, String>>,
    pub adapter_args: Option<BTreeMap<String, serde_json::Value>>,
    /// Connection attempts before giving up.
    pub attempts: u32,
    pub auto_import: bool,
    pub bigint_id: bool,
    /// Log every statement the handle runs.
    pub debug: bool,
    pub lazy_tables: bool,
    pub db_uid: Option<String>,
    /// Connect when the handle is created rather than on first use.
    pub do_connect: bool,
    pub tables: Option<Vec<String>>,
    pub ignore_field_case: bool,
    pub entity_quoting: bool,
    pub table_hash: Option<String>,
    /// Context keyword the handle is injected under.
    pub keyword: String,
}

impl Default for DalConfig {
    fn default() -> Self {
        Self {
            uri: "sqlite://storage.sqlite".to_string(),
            autocommit: false,
            pool_size: 0,
            folder: None,
            db_codec: "UTF-8".to_string(),
            check_reserved: None,
            migrate: true,
            fake_migrate: false,
            migrate_enabled: true,
            fake_migrate_all: false,
            decode_credentials: false,
            driver_args: None,
            adapter_args: None,
            attempts: 5,
            auto_import: false,
            bigint_id: false,
            debug: false,
            lazy_tables: false,
            db_uid: None,
            do_connect: true,
            tables: None,
            ignore_field_case: true,
            entity_quoting: false,
            table_hash: None,
            keyword: DEFAULT_KEYWORD.to_string(),
        }
    }
}

/// Route-local overrides. A `Some` field wins over the instance default.
///
/// For fields that are optional on [`DalConfig`], `None` here means "not
/// overridden"; a route cannot clear an instance value back to `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DalOverrides {
    pub uri: Option<String>,
    pub autocommit: Option<bool>,
    pub pool_size: Option<u32>,
    pub folder: Option<PathBuf>,
    pub db_codec: Option<String>,
    pub check_reserved: Option<Vec<String>>,
    pub migrate: Option<bool>,
    pub fake_migrate: Option<bool>,
    pub migrate_enabled: Option<bool>,
    pub fake_migrate_all: Option<bool>,
    pub decode_credentials: Option<bool>,
    pub driver_args: Option<BTreeMap<String, String>>,
    pub adapter_args: Option<BTreeMap<String, serde_json::Value>>,
    pub attempts: Option<u32>,
    pub auto_import: Option<bool>,
    pub bigint_id: Option<bool>,
    pub debug: Option<bool>,
    pub lazy_tables: Option<bool>,
    pub db_uid: Option<String>,
    pub do_connect: Option<bool>,
    pub tables: Option<Vec<String>>,
    pub ignore_field_case: Option<bool>,
    pub entity_quoting: Option<bool>,
    pub table_hash: Option<String>,
    pub keyword: Option<String>,
}

// `required` fields are plain on `DalConfig`; `optional` ones are `Option` on both sides.
macro_rules! overlay_fields {
    ($base:expr, $over:expr; required: $($r:ident),*; optional: $($o:ident),* $(;)?) => {
        DalConfig {
            $($r: $over.$r.clone().unwrap_or_else(|| $base.$r.clone()),)*
            $($o: $over.$o.clone().or_else(|| $base.$o.clone()),)*
        }
    };
}

impl DalConfig {
    /// `true` when one process-wide handle is shared by every request.
    pub fn pooled(&self) -> bool {
        self.pool_size > 0
    }

    /// Returns the effective configuration for a route, field by field.
    ///
    /// # Examples
    ///
    /// ```
    /// use rttp_dal::database::{DalConfig, DalOverrides};
    ///
    /// let defaults = DalConfig::default();
    /// let route = DalOverrides { autocommit: Some(true), ..Default::default() };
    ///
    /// let effective = defaults.overlay(&route);
    /// assert!(effective.autocommit);
    /// assert_eq!(effective.uri, defaults.uri);
    /// assert!(!defaults.autocommit);
    /// ```
    #[must_use]
    pub fn overlay(&self, overrides: &DalOverrides) -> DalConfig {
        overlay_fields!(self, overrides;
            required: uri, autocommit, pool_size, db_codec, migrate, fake_migrate,
                migrate_enabled, fake_migrate_all, decode_credentials, attempts,
                auto_import, bigint_id, debug, lazy_tables, do_connect,
                ignore_field_case, entity_quoting, keyword;
            optional: folder, check_reserved, driver_args, adapter_args, db_uid,
                tables, table_hash;
        )
    }

    /// Checks the invariants the plugin relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.uri.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "uri",
                reason: "must not be empty".to_string(),
            });
        }
        if !is_identifier(&self.keyword) {
            return Err(ConfigError::Invalid {
                field: "keyword",
                reason: format!("`{}` is not a valid identifier", self.keyword),
            });
        }
        if self.attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Loads defaults, then `path`, then `DAL_*` environment variables.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::extract(
            Figment::new()
                .merge(Serialized::defaults(DalConfig::default()))
                .merge(Toml::file(path.as_ref()))
                .merge(Env::prefixed("DAL_")),
        )
    }

    /// Loads defaults overlaid with a TOML document. Environment is not consulted.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Self::extract(
            Figment::new()
                .merge(Serialized::defaults(DalConfig::default()))
                .merge(Toml::string(toml)),
        )
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: DalConfig = figment
            .extract()
            .map_err(|e| ConfigError::Load(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

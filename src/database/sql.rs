//! sqlx-backed handles over the runtime-selected `Any` driver.
//!
//! [`SqlBackend`] opens a [`SqlHandle`] from a [`DalConfig`]: it resolves the
//! URI (folder and driver arguments), checks the codec, and connects with the
//! configured number of attempts. A handle owns one `AnyConnection` and runs
//! every statement inside an implicit transaction that `commit` / `rollback`
//! end.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use sqlx::any::{AnyArguments, AnyConnectOptions, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyConnection, Column, ConnectOptions, Connection, Executor, Row as _};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::backend::{Backend, Session};
use super::config::DalConfig;
use super::error::{ConnectionError, DatabaseError, redact_uri};
use crate::router::BoxFuture;

/// Pause between connection attempts.
const RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// Column type a NULL parameter is sent as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Int,
    Real,
    Text,
    Bool,
    Blob,
}

/// A bound parameter or a decoded column value.
///
/// PostgreSQL types every parameter, so a NULL headed for a non-text column
/// must say what it is: bind [`Value::NullOf`] (or convert from a typed
/// `None`, e.g. `Value::from(None::<i64>)`). A bare [`Value::Null`] is sent
/// as a text NULL. SQLite accepts either. Decoded NULL columns are always
/// [`Value::Null`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    NullOf(ValueKind),
    Int(i64),
    Real(f64),
    Text(String),
    Bool(bool),
    Blob(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null | Value::NullOf(_))
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

// `None` keeps the column type of the `Some` side.
macro_rules! impl_from_option {
    ($($ty:ty => $kind:ident),* $(,)?) => {
        $(
            impl From<Option<$ty>> for Value {
                fn from(v: Option<$ty>) -> Self {
                    v.map_or(Value::NullOf(ValueKind::$kind), Into::into)
                }
            }
        )*
    };
}

impl_from_option!(
    i64 => Int,
    f64 => Real,
    bool => Bool,
    &str => Text,
    String => Text,
    Vec<u8> => Blob,
);

/// One result row: column names and their decoded values, in select order.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }
}

/// Opens [`SqlHandle`]s through sqlx's `Any` driver (SQLite and PostgreSQL).
#[derive(Debug, Clone, Copy)]
pub struct SqlBackend;

impl SqlBackend {
    pub fn new() -> Self {
        sqlx::any::install_default_drivers();
        Self
    }
}

impl Default for SqlBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for SqlBackend {
    type Handle = SqlHandle;

    fn connect<'a>(
        &'a self,
        settings: &'a DalConfig,
    ) -> BoxFuture<'a, Result<SqlHandle, ConnectionError>> {
        Box::pin(SqlHandle::open(settings.clone()))
    }
}

struct HandleState {
    conn: Option<AnyConnection>,
    in_transaction: bool,
    closed: bool,
}

/// An open (or, with `do_connect = false`, lazily opened) database session.
///
/// Statements are serialized on the single underlying connection. The first
/// statement after open, commit, or rollback begins a transaction.
pub struct SqlHandle {
    settings: DalConfig,
    options: AnyConnectOptions,
    state: Mutex<HandleState>,
}

impl fmt::Debug for SqlHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlHandle")
            .field("uri", &redact_uri(&self.settings.uri))
            .field("db_uid", &self.settings.db_uid)
            .finish()
    }
}

impl SqlHandle {
    /// Builds a handle from `settings`, connecting now unless `do_connect` is off.
    pub async fn open(settings: DalConfig) -> Result<Self, ConnectionError> {
        check_codec(&settings.db_codec)?;
        let url = resolve_uri(&settings);
        let mut options =
            AnyConnectOptions::from_str(&url).map_err(|e| ConnectionError::InvalidUri {
                uri: redact_uri(&url),
                reason: e.to_string(),
            })?;
        if !settings.debug {
            options = options.disable_statement_logging();
        }

        let conn = if settings.do_connect {
            Some(connect_with_retry(&options, settings.attempts).await?)
        } else {
            None
        };
        debug!(
            uri = %redact_uri(&url),
            db_uid = settings.db_uid.as_deref().unwrap_or(""),
            connected = conn.is_some(),
            "database handle opened"
        );

        Ok(Self {
            settings,
            options,
            state: Mutex::new(HandleState {
                conn,
                in_transaction: false,
                closed: false,
            }),
        })
    }

    /// The configuration this handle was opened with.
    pub fn settings(&self) -> &DalConfig {
        &self.settings
    }

    /// Runs a statement and returns the number of affected rows.
    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, DatabaseError> {
        let mut state = self.state.lock().await;
        let conn = self.ready(&mut state).await?;
        let result = bind_all(sqlx::query(sql), params).execute(&mut *conn).await?;
        Ok(result.rows_affected())
    }

    pub async fn fetch_all(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, DatabaseError> {
        let mut state = self.state.lock().await;
        let conn = self.ready(&mut state).await?;
        let rows = bind_all(sqlx::query(sql), params).fetch_all(&mut *conn).await?;
        Ok(rows.iter().map(decode_row).collect())
    }

    pub async fn fetch_optional(
        &self,
        sql: &str,
        params: &[Value],
    ) -> Result<Option<Row>, DatabaseError> {
        let mut state = self.state.lock().await;
        let conn = self.ready(&mut state).await?;
        let row = bind_all(sqlx::query(sql), params)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row.as_ref().map(decode_row))
    }

    /// Returns the first column of the first row, or [`Value::Null`] if there is none.
    pub async fn scalar(&self, sql: &str, params: &[Value]) -> Result<Value, DatabaseError> {
        let row = self.fetch_optional(sql, params).await?;
        Ok(row
            .and_then(|r| r.values.into_iter().next())
            .unwrap_or(Value::Null))
    }

    /// Commits the open transaction. A no-op when none is open.
    pub async fn commit(&self) -> Result<(), DatabaseError> {
        let mut state = self.state.lock().await;
        if !state.in_transaction {
            return Ok(());
        }
        let conn = state.conn.as_mut().ok_or(DatabaseError::Closed)?;
        (&mut *conn).execute("COMMIT").await?;
        state.in_transaction = false;
        debug!(db_uid = self.settings.db_uid.as_deref().unwrap_or(""), "transaction committed");
        Ok(())
    }

    /// Rolls back the open transaction. A no-op when none is open.
    pub async fn rollback(&self) -> Result<(), DatabaseError> {
        let mut state = self.state.lock().await;
        if !state.in_transaction {
            return Ok(());
        }
        // The transaction is over whether or not ROLLBACK itself succeeds.
        state.in_transaction = false;
        let conn = state.conn.as_mut().ok_or(DatabaseError::Closed)?;
        (&mut *conn).execute("ROLLBACK").await?;
        debug!(db_uid = self.settings.db_uid.as_deref().unwrap_or(""), "transaction rolled back");
        Ok(())
    }

    /// Rolls back anything uncommitted and releases the connection.
    pub async fn close(&self) -> Result<(), DatabaseError> {
        let mut state = self.state.lock().await;
        state.closed = true;
        let in_transaction = std::mem::take(&mut state.in_transaction);
        let Some(mut conn) = state.conn.take() else {
            return Ok(());
        };
        if in_transaction {
            if let Err(e) = (&mut conn).execute("ROLLBACK").await {
                warn!(error = %e, "rollback on close failed");
            }
        }
        conn.close().await?;
        Ok(())
    }

    // Connects lazily and opens a transaction if none is active.
    async fn ready<'s>(
        &self,
        state: &'s mut HandleState,
    ) -> Result<&'s mut AnyConnection, DatabaseError> {
        if state.closed {
            return Err(DatabaseError::Closed);
        }
        if state.conn.is_none() {
            state.conn = Some(connect_with_retry(&self.options, self.settings.attempts).await?);
        }
        let conn = state.conn.as_mut().ok_or(DatabaseError::Closed)?;
        if !state.in_transaction {
            (&mut *conn).execute("BEGIN").await?;
            state.in_transaction = true;
        }
        Ok(conn)
    }
}

impl Session for SqlHandle {
    fn commit(&self) -> BoxFuture<'_, Result<(), DatabaseError>> {
        Box::pin(SqlHandle::commit(self))
    }

    fn rollback(&self) -> BoxFuture<'_, Result<(), DatabaseError>> {
        Box::pin(SqlHandle::rollback(self))
    }

    fn close(&self) -> BoxFuture<'_, Result<(), DatabaseError>> {
        Box::pin(SqlHandle::close(self))
    }
}

fn check_codec(codec: &str) -> Result<(), ConnectionError> {
    let normalized = codec.replace(['-', '_'], "").to_ascii_lowercase();
    if normalized == "utf8" {
        Ok(())
    } else {
        Err(ConnectionError::UnsupportedCodec(codec.to_string()))
    }
}

/// Applies `folder` to relative SQLite paths and appends `driver_args` as
/// percent-encoded query parameters. SQLite files are created if missing
/// unless a `mode` is given.
fn resolve_uri(settings: &DalConfig) -> String {
    let mut uri = settings.uri.clone();

    if let (Some(folder), Some(rest)) = (&settings.folder, settings.uri.strip_prefix("sqlite://")) {
        let is_relative = !rest.starts_with('/') && !rest.starts_with(":memory:");
        if is_relative {
            uri = format!("sqlite://{}", folder.join(rest).display());
        }
    }

    let mut params: Vec<String> = settings
        .driver_args
        .iter()
        .flatten()
        .map(|(k, v)| {
            format!(
                "{}={}",
                utf8_percent_encode(k, NON_ALPHANUMERIC),
                utf8_percent_encode(v, NON_ALPHANUMERIC)
            )
        })
        .collect();

    let has_mode = settings.driver_args.iter().flatten().any(|(k, _)| k == "mode")
        || query_has_key(&uri, "mode");
    if settings.uri.starts_with("sqlite://") && !has_mode {
        params.push("mode=rwc".to_string());
    }

    if !params.is_empty() {
        let separator = if uri.contains('?') { '&' } else { '?' };
        uri = format!("{uri}{separator}{}", params.join("&"));
    }

    uri
}

fn query_has_key(uri: &str, key: &str) -> bool {
    let Some((_, query)) = uri.split_once('?') else {
        return false;
    };
    query
        .split('&')
        .any(|pair| pair.split('=').next() == Some(key))
}

async fn connect_with_retry(
    options: &AnyConnectOptions,
    attempts: u32,
) -> Result<AnyConnection, ConnectionError> {
    let attempts = attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match options.connect().await {
            Ok(conn) => {
                if attempt > 1 {
                    info!(attempt, attempts, "database connection recovered");
                }
                return Ok(conn);
            }
            Err(e) => {
                if attempt < attempts {
                    warn!(attempt, attempts, error = %e, "database connection failed, retrying");
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
                last_error = Some(e);
            }
        }
    }

    Err(ConnectionError::Failed {
        attempts,
        source: match last_error {
            Some(e) => Box::new(e),
            None => "no connection attempt was made".into(),
        },
    })
}

fn bind_all<'q>(
    mut query: Query<'q, Any, AnyArguments<'q>>,
    params: &[Value],
) -> Query<'q, Any, AnyArguments<'q>> {
    for param in params {
        query = match param {
            Value::Null | Value::NullOf(ValueKind::Text) => query.bind(None::<String>),
            Value::NullOf(ValueKind::Int) => query.bind(None::<i64>),
            Value::NullOf(ValueKind::Real) => query.bind(None::<f64>),
            Value::NullOf(ValueKind::Bool) => query.bind(None::<bool>),
            Value::NullOf(ValueKind::Blob) => query.bind(None::<Vec<u8>>),
            Value::Int(v) => query.bind(*v),
            Value::Real(v) => query.bind(*v),
            Value::Text(v) => query.bind(v.clone()),
            Value::Bool(v) => query.bind(*v),
            Value::Blob(v) => query.bind(v.clone()),
        };
    }
    query
}

fn decode_row(row: &AnyRow) -> Row {
    Row {
        columns: row.columns().iter().map(|c| c.name().to_string()).collect(),
        values: (0..row.len()).map(|i| decode_value(row, i)).collect(),
    }
}

// The Any driver only reports a coarse kind, so try the decodings in turn.
fn decode_value(row: &AnyRow, index: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return v.map_or(Value::Null, Value::Int);
    }
    if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(index) {
        return Value::Real(v);
    }
    if let Ok(Some(v)) = row.try_get::<Option<String>, _>(index) {
        return Value::Text(v);
    }
    if let Ok(Some(v)) = row.try_get::<Option<bool>, _>(index) {
        return Value::Bool(v);
    }
    if let Ok(Some(v)) = row.try_get::<Option<Vec<u8>>, _>(index) {
        return Value::Blob(v);
    }
    Value::Null
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn sqlite_settings(dir: &tempfile::TempDir) -> DalConfig {
        DalConfig {
            uri: "sqlite://app.db".to_string(),
            folder: Some(dir.path().to_path_buf()),
            driver_args: Some([("mode".to_string(), "rwc".to_string())].into()),
            attempts: 1,
            ..DalConfig::default()
        }
    }

    #[test]
    fn resolve_uri_applies_folder_and_driver_args() {
        let settings = DalConfig {
            uri: "sqlite://app.db".into(),
            folder: Some(PathBuf::from("/srv/data")),
            driver_args: Some([("mode".to_string(), "rwc".to_string())].into()),
            ..DalConfig::default()
        };
        assert_eq!(resolve_uri(&settings), "sqlite:///srv/data/app.db?mode=rwc");

        let absolute = DalConfig {
            uri: "sqlite:///var/app.db?cache=shared".into(),
            folder: Some(PathBuf::from("/srv/data")),
            driver_args: Some([("mode".to_string(), "ro".to_string())].into()),
            ..DalConfig::default()
        };
        assert_eq!(resolve_uri(&absolute), "sqlite:///var/app.db?cache=shared&mode=ro");

        let postgres = DalConfig {
            uri: "postgres://app@localhost/app".into(),
            folder: Some(PathBuf::from("/srv/data")),
            ..DalConfig::default()
        };
        assert_eq!(resolve_uri(&postgres), "postgres://app@localhost/app");
    }

    #[test]
    fn sqlite_files_are_created_unless_a_mode_is_given() {
        let settings = DalConfig {
            folder: Some(PathBuf::from("/srv/data")),
            ..DalConfig::default()
        };
        assert_eq!(resolve_uri(&settings), "sqlite:///srv/data/storage.sqlite?mode=rwc");

        let read_only = DalConfig {
            uri: "sqlite:///var/app.db?mode=ro".into(),
            ..DalConfig::default()
        };
        assert_eq!(resolve_uri(&read_only), "sqlite:///var/app.db?mode=ro");

        let memory = DalConfig {
            uri: "sqlite::memory:".into(),
            ..DalConfig::default()
        };
        assert_eq!(resolve_uri(&memory), "sqlite::memory:");
    }

    #[test]
    fn driver_args_are_percent_encoded() {
        let settings = DalConfig {
            uri: "postgres://app@localhost/app".into(),
            driver_args: Some(
                [
                    ("application_name".to_string(), "rttp & co".to_string()),
                    ("options".to_string(), "-c x=1#y".to_string()),
                ]
                .into(),
            ),
            ..DalConfig::default()
        };
        assert_eq!(
            resolve_uri(&settings),
            "postgres://app@localhost/app?application%5Fname=rttp%20%26%20co&options=%2Dc%20x%3D1%23y"
        );
    }

    #[test]
    fn codec_must_be_utf8() {
        assert!(check_codec("UTF-8").is_ok());
        assert!(check_codec("utf8").is_ok());
        assert!(matches!(
            check_codec("latin1"),
            Err(ConnectionError::UnsupportedCodec(c)) if c == "latin1"
        ));
    }

    #[test]
    fn value_conversions() {
        assert_eq!(Value::from(3_i64).as_i64(), Some(3));
        assert_eq!(Value::from("x").as_str(), Some("x"));
        assert_eq!(Value::from(None::<i64>), Value::NullOf(ValueKind::Int));
        assert_eq!(Value::from(None::<&str>), Value::NullOf(ValueKind::Text));
        assert_eq!(Value::from(Some(true)), Value::Bool(true));
        assert!(Value::from(None::<bool>).is_null());
        assert!(Value::Null.is_null());
    }

    #[tokio::test]
    async fn unsupported_codec_fails_before_connecting() {
        let settings = DalConfig {
            uri: "sqlite::memory:".into(),
            db_codec: "latin1".into(),
            ..DalConfig::default()
        };
        let err = SqlBackend::new().connect(&settings).await.unwrap_err();
        assert!(matches!(err, ConnectionError::UnsupportedCodec(_)));
    }

    #[tokio::test]
    async fn invalid_uri_is_reported() {
        let settings = DalConfig {
            uri: "not a url".into(),
            ..DalConfig::default()
        };
        let err = SqlBackend::new().connect(&settings).await.unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidUri { .. }));
    }

    #[tokio::test]
    async fn commit_persists_and_rollback_discards() {
        let dir = tempfile::tempdir().unwrap();
        let settings = sqlite_settings(&dir);
        let backend = SqlBackend::new();

        let db = backend.connect(&settings).await.unwrap();
        db.execute("CREATE TABLE person (id INTEGER PRIMARY KEY, name TEXT NOT NULL)", &[])
            .await
            .unwrap();
        db.execute("INSERT INTO person (name) VALUES (?)", &["James".into()])
            .await
            .unwrap();
        db.commit().await.unwrap();

        db.execute("INSERT INTO person (name) VALUES (?)", &["Michael".into()])
            .await
            .unwrap();
        db.rollback().await.unwrap();
        db.close().await.unwrap();

        let other = backend.connect(&settings).await.unwrap();
        let rows = other.fetch_all("SELECT id, name FROM person", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("name"), Some(&Value::Text("James".into())));
        assert_eq!(rows[0].columns(), &["id".to_string(), "name".to_string()]);
        other.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_discards_uncommitted_work() {
        let dir = tempfile::tempdir().unwrap();
        let settings = sqlite_settings(&dir);
        let backend = SqlBackend::new();

        let db = backend.connect(&settings).await.unwrap();
        db.execute("CREATE TABLE t (n INTEGER)", &[]).await.unwrap();
        db.commit().await.unwrap();
        db.execute("INSERT INTO t (n) VALUES (?)", &[1_i64.into()])
            .await
            .unwrap();
        db.close().await.unwrap();
        assert!(matches!(db.execute("SELECT 1", &[]).await, Err(DatabaseError::Closed)));

        let other = backend.connect(&settings).await.unwrap();
        let count = other.scalar("SELECT COUNT(*) FROM t", &[]).await.unwrap();
        assert_eq!(count, Value::Int(0));
        other.close().await.unwrap();
    }

    #[tokio::test]
    async fn default_config_opens_a_new_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let settings = DalConfig {
            folder: Some(dir.path().to_path_buf()),
            attempts: 1,
            ..DalConfig::default()
        };
        let db = SqlBackend::new().connect(&settings).await.unwrap();
        db.execute("CREATE TABLE t (n INTEGER)", &[]).await.unwrap();
        db.commit().await.unwrap();
        db.close().await.unwrap();
        assert!(dir.path().join("storage.sqlite").exists());
    }

    #[tokio::test]
    async fn typed_nulls_bind_into_typed_columns() {
        let db = SqlBackend::new()
            .connect(&DalConfig {
                uri: "sqlite::memory:".into(),
                attempts: 1,
                ..DalConfig::default()
            })
            .await
            .unwrap();
        db.execute("CREATE TABLE t (n INTEGER, ok BOOLEAN, r REAL, b BLOB)", &[])
            .await
            .unwrap();
        let params = [
            Value::from(None::<i64>),
            Value::from(None::<bool>),
            Value::from(None::<f64>),
            Value::from(None::<Vec<u8>>),
        ];
        db.execute("INSERT INTO t (n, ok, r, b) VALUES (?, ?, ?, ?)", &params)
            .await
            .unwrap();

        let row = db.fetch_optional("SELECT n, ok, r, b FROM t", &[]).await.unwrap().unwrap();
        assert!(row.values().iter().all(|v| *v == Value::Null));
    }

    #[tokio::test]
    async fn lazy_handle_connects_on_first_statement() {
        let dir = tempfile::tempdir().unwrap();
        let settings = DalConfig {
            do_connect: false,
            ..sqlite_settings(&dir)
        };
        let db = SqlBackend::new().connect(&settings).await.unwrap();
        assert!(!dir.path().join("app.db").exists());

        let one = db.scalar("SELECT 1", &[]).await.unwrap();
        assert_eq!(one, Value::Int(1));
        assert!(dir.path().join("app.db").exists());
        // Nothing to end yet beyond the read transaction.
        db.commit().await.unwrap();
        db.commit().await.unwrap();
    }

    #[tokio::test]
    async fn scalar_on_empty_result_is_null() {
        let db = SqlBackend::new()
            .connect(&DalConfig {
                uri: "sqlite::memory:".into(),
                attempts: 1,
                ..DalConfig::default()
            })
            .await
            .unwrap();
        db.execute("CREATE TABLE t (n INTEGER)", &[]).await.unwrap();
        assert_eq!(db.scalar("SELECT n FROM t", &[]).await.unwrap(), Value::Null);
        assert!(db.fetch_optional("SELECT n FROM t", &[]).await.unwrap().is_none());
        assert_eq!(db.settings().uri, "sqlite::memory:");
    }
}

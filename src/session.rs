//! Sessions: dialing, read modes, write safety and server commands.

use mongodb::options::{
    Acknowledgment, ClientOptions, DatabaseOptions, ReadPreference, SelectionCriteria,
    WriteConcern,
};
use mongodb::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::database::Database;
use crate::deadline::{bounded, SHORT_TIMEOUT};
use crate::error::Result;

const DEFAULT_DATABASE: &str = "test";

/// Options applied on top of the connection string when dialing.
#[derive(Debug, Clone, Default)]
pub struct DialOptions {
    /// Connect and server selection timeout.
    pub timeout: Option<Duration>,
    /// Application name for server logs.
    pub app_name: Option<String>,
    /// Maximum number of connections in the pool.
    pub max_pool_size: Option<u32>,
    /// Minimum number of connections in the pool.
    pub min_pool_size: Option<u32>,
    /// Direct connection (bypass replica set discovery).
    pub direct_connection: Option<bool>,
}

impl DialOptions {
    pub fn builder() -> DialOptionsBuilder {
        DialOptionsBuilder::default()
    }

    fn apply(&self, options: &mut ClientOptions) {
        if let Some(timeout) = self.timeout {
            options.connect_timeout = Some(timeout);
            options.server_selection_timeout = Some(timeout);
        }
        if let Some(name) = &self.app_name {
            options.app_name = Some(name.clone());
        }
        if let Some(size) = self.max_pool_size {
            options.max_pool_size = Some(size);
        }
        if let Some(size) = self.min_pool_size {
            options.min_pool_size = Some(size);
        }
        if let Some(direct) = self.direct_connection {
            options.direct_connection = Some(direct);
        }
    }
}

/// Builder for DialOptions.
#[derive(Debug, Clone, Default)]
pub struct DialOptionsBuilder {
    options: DialOptions,
}

impl DialOptionsBuilder {
    /// Set the connect and server selection timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.options.app_name = Some(name.into());
        self
    }

    /// Set the maximum pool size.
    pub fn max_pool_size(mut self, size: u32) -> Self {
        self.options.max_pool_size = Some(size);
        self
    }

    /// Set the minimum pool size.
    pub fn min_pool_size(mut self, size: u32) -> Self {
        self.options.min_pool_size = Some(size);
        self
    }

    /// Enable or disable direct connection.
    pub fn direct_connection(mut self, direct: bool) -> Self {
        self.options.direct_connection = Some(direct);
        self
    }

    pub fn build(self) -> DialOptions {
        self.options
    }
}

/// Read preference mode, numbered as in the legacy driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Eventual = 0,
    Monotonic = 1,
    Primary = 2,
    PrimaryPreferred = 3,
    Secondary = 4,
    SecondaryPreferred = 5,
    Nearest = 6,
}

impl Mode {
    /// Legacy alias of [`Mode::Primary`].
    pub const STRONG: Mode = Mode::Primary;

    /// The driver read preference for this mode. The legacy-only modes read
    /// from the primary.
    pub fn read_preference(self) -> ReadPreference {
        match self {
            Mode::Primary | Mode::Eventual | Mode::Monotonic => ReadPreference::Primary,
            Mode::PrimaryPreferred => ReadPreference::PrimaryPreferred { options: None },
            Mode::Secondary => ReadPreference::Secondary { options: None },
            Mode::SecondaryPreferred => ReadPreference::SecondaryPreferred { options: None },
            Mode::Nearest => ReadPreference::Nearest { options: None },
        }
    }
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Primary
    }
}

/// Write acknowledgement settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Safe {
    /// Minimum number of servers to acknowledge the write.
    pub w: u32,
    /// Named write mode such as `"majority"`; takes precedence over `w`.
    pub w_mode: String,
    /// Kept for source compatibility; reads are governed by [`Mode`].
    pub r_mode: String,
    /// Acknowledgement timeout in milliseconds, 0 for none.
    pub w_timeout: u64,
    pub fsync: bool,
    /// Wait for the journal commit.
    pub j: bool,
}

impl Default for Safe {
    fn default() -> Self {
        Self {
            w: 1,
            w_mode: String::new(),
            r_mode: String::new(),
            w_timeout: 0,
            fsync: false,
            j: false,
        }
    }
}

impl Safe {
    pub(crate) fn write_concern(&self) -> WriteConcern {
        let mut wc = WriteConcern::default();
        wc.w = match self.w_mode.as_str() {
            "" if self.w > 0 => Some(Acknowledgment::Nodes(self.w)),
            "" => None,
            "majority" => Some(Acknowledgment::Majority),
            other => Some(Acknowledgment::Custom(other.to_string())),
        };
        if self.w_timeout > 0 {
            wc.w_timeout = Some(Duration::from_millis(self.w_timeout));
        }
        if self.j || self.fsync {
            wc.journal = Some(true);
        }
        wc
    }
}

/// Server build details as reported by `buildInfo`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildInfo {
    pub version: String,
    #[serde(rename = "versionArray")]
    pub version_array: Vec<i32>,
    #[serde(rename = "gitVersion")]
    pub git_version: String,
    #[serde(rename = "OpenSSLVersion")]
    pub openssl_version: String,
    #[serde(rename = "sysInfo")]
    pub sys_info: String,
    pub bits: i32,
    pub debug: bool,
    #[serde(rename = "maxBsonObjectSize")]
    pub max_object_size: i32,
}

impl BuildInfo {
    /// Whether the server version is at least `version`, compared component-wise.
    pub fn version_at_least(&self, version: &[i32]) -> bool {
        for (i, want) in version.iter().enumerate() {
            let Some(have) = self.version_array.get(i) else {
                return false;
            };
            if have != want {
                return have > want;
            }
        }
        true
    }
}

/// A connection to a deployment, shaped like the legacy session.
///
/// Copies share the driver's connection pool. Only closing the session that
/// was originally dialed shuts the pool down.
///
/// # Example
///
/// ```ignore
/// use mgo_compat::{m, Session};
///
/// #[tokio::main]
/// async fn main() -> mgo_compat::Result<()> {
///     let session = Session::dial("mongodb://localhost/app").await?;
///     let people = session.db("").c("people");
///     people.insert(&[m! { "name" => "Ann" }]).await?;
///     session.close().await;
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct Session {
    client: Client,
    db_name: String,
    mode: Mode,
    safe: Option<Safe>,
    is_original: bool,
}

/// Second name of [`Session`], kept for callers of the wrapper API.
pub type ModernMgo = Session;

impl Session {
    /// Connect with the default options.
    pub async fn dial(uri: &str) -> Result<Self> {
        Self::dial_with_options(uri, DialOptions::default()).await
    }

    /// Connect with an explicit connect timeout.
    pub async fn dial_with_timeout(uri: &str, timeout: Duration) -> Result<Self> {
        Self::dial_with_options(uri, DialOptions::builder().timeout(timeout).build()).await
    }

    /// Same as [`Session::dial`].
    pub async fn dial_modern(uri: &str) -> Result<Self> {
        Self::dial(uri).await
    }

    /// Connect with custom options.
    ///
    /// Retryable writes are always disabled.
    pub async fn dial_with_options(uri: &str, dial: DialOptions) -> Result<Self> {
        let mut options = ClientOptions::parse(uri).await?;
        dial.apply(&mut options);
        options.retry_writes = Some(false);

        let client = Client::with_options(options)?;
        let db_name = default_database_name(uri);
        info!(database = %db_name, "session dialed");

        Ok(Self {
            client,
            db_name,
            mode: Mode::default(),
            safe: Some(Safe::default()),
            is_original: true,
        })
    }

    /// Release the session. Shuts the connection pool down only for the
    /// originally dialed session.
    pub async fn close(self) {
        if self.is_original {
            info!(database = %self.db_name, "closing session");
            self.client.shutdown().immediate(true).await;
        } else {
            debug!("closing session copy");
        }
    }

    /// A new session sharing this one's connection pool.
    pub fn copy(&self) -> Session {
        Session {
            client: self.client.clone(),
            db_name: self.db_name.clone(),
            mode: self.mode,
            safe: self.safe.clone(),
            is_original: false,
        }
    }

    /// Set the read preference mode. `refresh` has no effect; the driver
    /// manages connections itself.
    pub fn set_mode(&mut self, mode: Mode, _refresh: bool) {
        self.mode = mode;
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Set write safety; `None` uses the deployment default.
    pub fn set_safe(&mut self, safe: Option<Safe>) {
        self.safe = safe;
    }

    pub fn safe(&self) -> Option<&Safe> {
        self.safe.as_ref()
    }

    /// Name of the database parsed from the connection string.
    pub fn default_db_name(&self) -> &str {
        &self.db_name
    }

    /// Database handle. An empty name selects the default database.
    pub fn db(&self, name: &str) -> Database {
        let name = if name.is_empty() { &self.db_name } else { name };
        let mut options = DatabaseOptions::default();
        options.selection_criteria = Some(SelectionCriteria::ReadPreference(
            self.mode.read_preference(),
        ));
        options.write_concern = self.safe.as_ref().map(Safe::write_concern);
        Database::new(self.client.database_with_options(name, options), name)
    }

    pub async fn ping(&self) -> Result<()> {
        debug!("ping");
        bounded(
            SHORT_TIMEOUT,
            self.client
                .database("admin")
                .run_command(bson::doc! { "ping": 1 }),
        )
        .await?;
        Ok(())
    }

    pub async fn build_info(&self) -> Result<BuildInfo> {
        let mut info = BuildInfo::default();
        self.run(true, &crate::m! { "buildInfo" => 1 }, &mut info).await?;
        Ok(info)
    }

    /// Run a command against `admin` when `admin` is set, the default
    /// database otherwise.
    pub async fn run<C, R>(&self, admin: bool, cmd: &C, result: &mut R) -> Result<()>
    where
        C: Serialize + 'static,
        R: DeserializeOwned + 'static,
    {
        let name = if admin { "admin" } else { self.db_name.as_str() };
        self.db(name).run(cmd, result).await
    }

    pub async fn database_names(&self) -> Result<Vec<String>> {
        bounded(SHORT_TIMEOUT, self.client.list_database_names()).await
    }
}

impl Clone for Session {
    /// Same as [`Session::copy`]: the clone never owns the pool.
    fn clone(&self) -> Self {
        self.copy()
    }
}

/// Database name from the path of a connection string, `"test"` when absent.
pub(crate) fn default_database_name(uri: &str) -> String {
    let without_scheme = uri
        .strip_prefix("mongodb://")
        .or_else(|| uri.strip_prefix("mongodb+srv://"))
        .unwrap_or(uri);

    without_scheme
        .find('/')
        .map(|start| &without_scheme[start + 1..])
        .and_then(|path| path.split('?').next())
        .filter(|name| !name.is_empty())
        .unwrap_or(DEFAULT_DATABASE)
        .to_string()
}

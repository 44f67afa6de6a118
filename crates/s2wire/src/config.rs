//! Connection configuration.
//!
//! [`Config`] is a builder over every connection option. It can also be
//! parsed from a URL:
//!
//! ```text
//! s2://user:password@host1:3306,host2:3307/database?compression=true&fetch_size=100
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use s2wire_core::error::ConfigError;
use s2wire_core::{Error, Result};

use crate::auth::{AuthPlugin, AuthRegistry};
use crate::ha::{HostAddress, HostRole, HostSelection};
use crate::protocol::charset;

pub const DEFAULT_PORT: u16 = 3306;

/// TLS upgrade policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Do not use TLS
    #[default]
    Disable,
    /// Use TLS when the server offers it
    Preferred,
    /// Require TLS, no certificate verification beyond the trust store
    Required,
    /// Require TLS and verify the server certificate chain
    VerifyCa,
    /// Require TLS and verify the certificate matches the host name
    VerifyIdentity,
}

impl SslMode {
    pub const fn should_try_ssl(self) -> bool {
        !matches!(self, SslMode::Disable)
    }

    pub const fn is_required(self) -> bool {
        matches!(
            self,
            SslMode::Required | SslMode::VerifyCa | SslMode::VerifyIdentity
        )
    }

    fn parse(value: &str) -> Option<Self> {
        Some(match value.to_ascii_lowercase().replace('-', "_").as_str() {
            "disable" | "disabled" | "false" => SslMode::Disable,
            "preferred" | "prefer" => SslMode::Preferred,
            "required" | "require" | "true" => SslMode::Required,
            "verify_ca" => SslMode::VerifyCa,
            "verify_identity" | "verify_full" => SslMode::VerifyIdentity,
            _ => return None,
        })
    }
}

/// Certificate material for the TLS upgrade.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// PEM file with trusted CA certificates (defaults to the webpki roots)
    pub ca_cert_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
    /// SNI / verification name, when it differs from the host
    pub server_name: Option<String>,
    /// Accept any server certificate.
    pub danger_skip_verify: bool,
}

impl TlsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    pub fn client_cert(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.client_cert_path = Some(cert.into());
        self.client_key_path = Some(key.into());
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn skip_verify(mut self, skip: bool) -> Self {
        self.danger_skip_verify = skip;
        self
    }
}

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub const fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        Some(
            match value
                .to_ascii_uppercase()
                .replace(['-', '_'], " ")
                .as_str()
            {
                "READ UNCOMMITTED" => IsolationLevel::ReadUncommitted,
                "READ COMMITTED" => IsolationLevel::ReadCommitted,
                "REPEATABLE READ" => IsolationLevel::RepeatableRead,
                "SERIALIZABLE" => IsolationLevel::Serializable,
                _ => return None,
            },
        )
    }
}

/// Connection configuration.
#[derive(Clone)]
pub struct Config {
    /// Candidate hosts, in preference order
    pub hosts: Vec<HostAddress>,
    pub user: String,
    pub password: Option<String>,
    pub database: Option<String>,
    /// Handshake collation id (default: utf8mb4)
    pub charset: u8,
    pub connect_timeout: Duration,
    /// Read/write timeout on the transport
    pub socket_timeout: Option<Duration>,
    /// Cooperative cancel timer applied to every command
    pub query_timeout: Option<Duration>,
    pub ssl_mode: SslMode,
    pub tls: TlsConfig,
    /// Negotiate CLIENT_COMPRESS
    pub compression: bool,
    /// Allow LOAD DATA LOCAL to read files named by the server
    pub local_infile: bool,
    /// Client max_allowed_packet
    pub max_packet_size: usize,
    /// Default fetch window; 0 materializes results fully
    pub fetch_size: usize,
    /// Prepared statement cache capacity; 0 disables caching
    pub prepare_cache_size: usize,
    /// Binary protocol for parameterized statements
    pub use_server_prepare: bool,
    pub allow_pipelining: bool,
    pub autocommit: bool,
    pub transaction_isolation: Option<IsolationLevel>,
    pub transaction_replay: bool,
    /// Replay log capacity, in commands
    pub transaction_replay_size: usize,
    /// How long a failed host stays denied
    pub deny_timeout: Duration,
    /// Extra connection rounds before denied hosts are tried
    pub retries_all_down: u32,
    pub host_selection: HostSelection,
    /// Turn on VECTOR / BSON column metadata (server 8.5.0 and later)
    pub enable_extended_data_types: bool,
    /// Send passwords in clear text over non-TLS transports
    pub allow_cleartext_password: bool,
    /// Let the server send its RSA public key for sha2 auth over plain TCP
    pub allow_public_key_retrieval: bool,
    /// PEM file with the server RSA public key
    pub server_rsa_public_key: Option<PathBuf>,
    /// CLIENT_CONNECT_ATTRS key/values
    pub connection_attributes: HashMap<String, String>,
    pub auth: AuthRegistry,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("hosts", &self.hosts)
            .field("user", &self.user)
            .field("database", &self.database)
            .field("ssl_mode", &self.ssl_mode)
            .field("compression", &self.compression)
            .field("host_selection", &self.host_selection)
            .field("transaction_replay", &self.transaction_replay)
            .finish_non_exhaustive()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hosts: vec![HostAddress::new("localhost", DEFAULT_PORT)],
            user: String::new(),
            password: None,
            database: None,
            charset: charset::DEFAULT_CHARSET,
            connect_timeout: Duration::from_secs(30),
            socket_timeout: None,
            query_timeout: None,
            ssl_mode: SslMode::default(),
            tls: TlsConfig::default(),
            compression: false,
            local_infile: false,
            max_packet_size: 16 * 1024 * 1024,
            fetch_size: 0,
            prepare_cache_size: 250,
            use_server_prepare: true,
            allow_pipelining: true,
            autocommit: true,
            transaction_isolation: None,
            transaction_replay: false,
            transaction_replay_size: 64,
            deny_timeout: Duration::from_secs(60),
            retries_all_down: 3,
            host_selection: HostSelection::default(),
            enable_extended_data_types: false,
            allow_cleartext_password: false,
            allow_public_key_retrieval: false,
            server_rsa_public_key: None,
            connection_attributes: HashMap::new(),
            auth: AuthRegistry::default(),
        }
    }
}

fn config_error(message: impl Into<String>) -> Error {
    Error::Config(ConfigError {
        message: message.into(),
        source: None,
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(config_error(format!("option {} expects a boolean, got '{}'", key, value))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| config_error(format!("option {} expects a number, got '{}'", key, value)))
}

/// Milliseconds; 0 means "no timeout" for the optional ones.
fn parse_millis(key: &str, value: &str) -> Result<Duration> {
    parse_number::<u64>(key, value).map(Duration::from_millis)
}

fn percent_decode(s: &str) -> Result<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = s
                .get(i + 1..i + 3)
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| config_error(format!("invalid percent escape in '{}'", s)))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| config_error(format!("invalid UTF-8 in '{}'", s)))
}

/// Parse `host`, `host:port` or `[v6addr]:port`.
fn parse_host(spec: &str, role: HostRole) -> Result<HostAddress> {
    let spec = spec.trim();
    let (host, port) = if let Some(rest) = spec.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| config_error(format!("unterminated IPv6 address '{}'", spec)))?;
        match after.strip_prefix(':') {
            Some(port) => (host, Some(port)),
            None => (host, None),
        }
    } else {
        match spec.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (spec, None),
        }
    };
    if host.is_empty() {
        return Err(config_error(format!("empty host in '{}'", spec)));
    }
    let port = match port {
        Some(p) => parse_number("port", p)?,
        None => DEFAULT_PORT,
    };
    Ok(HostAddress::new(host, port).with_role(role))
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a connection URL.
    ///
    /// Format: `s2://[user[:password]@]host[:port][,host[:port]...][/database][?key=value&...]`.
    /// `singlestore://` and `mysql://` schemes are accepted too. Timeouts
    /// in options are milliseconds.
    pub fn from_url(url: &str) -> Result<Self> {
        let rest = ["s2://", "singlestore://", "mysql://"]
            .iter()
            .find_map(|scheme| url.strip_prefix(scheme))
            .ok_or_else(|| config_error("URL must start with s2://, singlestore:// or mysql://"))?;

        let (location, query) = rest.split_once('?').unwrap_or((rest, ""));
        let (auth_hosts, database) = match location.split_once('/') {
            Some((ah, db)) if !db.is_empty() => (ah, Some(percent_decode(db)?)),
            Some((ah, _)) => (ah, None),
            None => (location, None),
        };

        let mut config = Config::new();
        let hosts = match auth_hosts.rsplit_once('@') {
            Some((auth, hosts)) => {
                let (user, password) = match auth.split_once(':') {
                    Some((u, p)) => (u, Some(p)),
                    None => (auth, None),
                };
                config.user = percent_decode(user)?;
                config.password = password.map(percent_decode).transpose()?;
                hosts
            }
            None => auth_hosts,
        };
        config.hosts = hosts
            .split(',')
            .filter(|h| !h.trim().is_empty())
            .map(|h| parse_host(h, HostRole::Primary))
            .collect::<Result<_>>()?;
        if config.hosts.is_empty() {
            return Err(config_error("URL names no host"));
        }
        config.database = database;

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, "true"));
            let value = percent_decode(value)?;
            config.apply_option(key, &value)?;
        }
        Ok(config)
    }

    /// Apply one `key=value` option.
    pub fn apply_option(&mut self, key: &str, value: &str) -> Result<()> {
        let optional = |d: Duration| (!d.is_zero()).then_some(d);
        match key {
            "user" => self.user = value.to_string(),
            "password" => self.password = Some(value.to_string()),
            "database" => self.database = Some(value.to_string()),
            "charset" => self.charset = parse_number(key, value)?,
            "connect_timeout" => self.connect_timeout = parse_millis(key, value)?,
            "socket_timeout" => self.socket_timeout = optional(parse_millis(key, value)?),
            "query_timeout" => self.query_timeout = optional(parse_millis(key, value)?),
            "ssl_mode" | "ssl" => {
                self.ssl_mode = SslMode::parse(value)
                    .ok_or_else(|| config_error(format!("unknown ssl_mode '{}'", value)))?;
            }
            "ssl_ca" => self.tls.ca_cert_path = Some(PathBuf::from(value)),
            "ssl_cert" => self.tls.client_cert_path = Some(PathBuf::from(value)),
            "ssl_key" => self.tls.client_key_path = Some(PathBuf::from(value)),
            "ssl_skip_verify" => self.tls.danger_skip_verify = parse_bool(key, value)?,
            "compression" => self.compression = parse_bool(key, value)?,
            "local_infile" => self.local_infile = parse_bool(key, value)?,
            "max_packet_size" => self.max_packet_size = parse_number(key, value)?,
            "fetch_size" => self.fetch_size = parse_number(key, value)?,
            "prepare_cache_size" => self.prepare_cache_size = parse_number(key, value)?,
            "use_server_prepare" => self.use_server_prepare = parse_bool(key, value)?,
            "allow_pipelining" => self.allow_pipelining = parse_bool(key, value)?,
            "autocommit" => self.autocommit = parse_bool(key, value)?,
            "transaction_isolation" => {
                self.transaction_isolation = Some(IsolationLevel::parse(value).ok_or_else(
                    || config_error(format!("unknown isolation level '{}'", value)),
                )?);
            }
            "transaction_replay" => self.transaction_replay = parse_bool(key, value)?,
            "transaction_replay_size" => self.transaction_replay_size = parse_number(key, value)?,
            "deny_timeout" => self.deny_timeout = parse_millis(key, value)?,
            "retries_all_down" => self.retries_all_down = parse_number(key, value)?,
            "host_selection" => {
                self.host_selection = HostSelection::parse(value)
                    .ok_or_else(|| config_error(format!("unknown host_selection '{}'", value)))?;
            }
            "replicas" => {
                for spec in value.split(',').filter(|s| !s.trim().is_empty()) {
                    self.hosts.push(parse_host(spec, HostRole::Replica)?);
                }
            }
            "enable_extended_data_types" => {
                self.enable_extended_data_types = parse_bool(key, value)?;
            }
            "allow_cleartext_password" => self.allow_cleartext_password = parse_bool(key, value)?,
            "allow_public_key_retrieval" => {
                self.allow_public_key_retrieval = parse_bool(key, value)?;
            }
            "server_rsa_public_key" => self.server_rsa_public_key = Some(PathBuf::from(value)),
            _ => return Err(config_error(format!("unknown option '{}'", key))),
        }
        Ok(())
    }

    /// Replace the host list with a single host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        let port = self.hosts.first().map_or(DEFAULT_PORT, |h| h.port);
        self.hosts = vec![HostAddress::new(host, port)];
        self
    }

    /// Set the port of every configured host.
    pub fn port(mut self, port: u16) -> Self {
        for h in &mut self.hosts {
            h.port = port;
        }
        self
    }

    /// Replace the host list.
    pub fn hosts(mut self, hosts: impl IntoIterator<Item = HostAddress>) -> Self {
        self.hosts = hosts.into_iter().collect();
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn charset(mut self, charset: u8) -> Self {
        self.charset = charset;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn socket_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.socket_timeout = timeout;
        self
    }

    pub fn query_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn ssl_mode(mut self, mode: SslMode) -> Self {
        self.ssl_mode = mode;
        self
    }

    pub fn tls_config(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    pub fn compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    /// Allow LOAD DATA LOCAL INFILE to read local files.
    ///
    /// The server chooses the file name, so only enable this for trusted
    /// servers.
    pub fn local_infile(mut self, enabled: bool) -> Self {
        self.local_infile = enabled;
        self
    }

    pub fn max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    pub fn fetch_size(mut self, rows: usize) -> Self {
        self.fetch_size = rows;
        self
    }

    pub fn prepare_cache_size(mut self, size: usize) -> Self {
        self.prepare_cache_size = size;
        self
    }

    pub fn use_server_prepare(mut self, enabled: bool) -> Self {
        self.use_server_prepare = enabled;
        self
    }

    pub fn allow_pipelining(mut self, enabled: bool) -> Self {
        self.allow_pipelining = enabled;
        self
    }

    pub fn autocommit(mut self, enabled: bool) -> Self {
        self.autocommit = enabled;
        self
    }

    pub fn transaction_isolation(mut self, level: IsolationLevel) -> Self {
        self.transaction_isolation = Some(level);
        self
    }

    pub fn transaction_replay(mut self, enabled: bool) -> Self {
        self.transaction_replay = enabled;
        self
    }

    pub fn transaction_replay_size(mut self, size: usize) -> Self {
        self.transaction_replay_size = size;
        self
    }

    pub fn deny_timeout(mut self, timeout: Duration) -> Self {
        self.deny_timeout = timeout;
        self
    }

    pub fn retries_all_down(mut self, retries: u32) -> Self {
        self.retries_all_down = retries;
        self
    }

    pub fn host_selection(mut self, selection: HostSelection) -> Self {
        self.host_selection = selection;
        self
    }

    pub fn enable_extended_data_types(mut self, enabled: bool) -> Self {
        self.enable_extended_data_types = enabled;
        self
    }

    pub fn allow_cleartext_password(mut self, allowed: bool) -> Self {
        self.allow_cleartext_password = allowed;
        self
    }

    pub fn allow_public_key_retrieval(mut self, allowed: bool) -> Self {
        self.allow_public_key_retrieval = allowed;
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.connection_attributes.insert(key.into(), value.into());
        self
    }

    /// Register an additional authentication plugin.
    pub fn auth_plugin(mut self, plugin: Arc<dyn AuthPlugin>) -> Self {
        self.auth.register(plugin);
        self
    }

    /// Capabilities requested from the server, before intersection.
    pub fn capability_flags(&self) -> u64 {
        use crate::protocol::capabilities::{
            CLIENT_COMPRESS, CLIENT_CONNECT_ATTRS, CLIENT_CONNECT_WITH_DB, CLIENT_LOCAL_FILES,
            CLIENT_SSL, DEFAULT_CLIENT_FLAGS,
        };

        let mut flags = DEFAULT_CLIENT_FLAGS;
        if self.database.is_some() {
            flags |= CLIENT_CONNECT_WITH_DB;
        }
        if self.ssl_mode.should_try_ssl() {
            flags |= CLIENT_SSL;
        }
        if self.compression {
            flags |= CLIENT_COMPRESS;
        }
        if self.local_infile {
            flags |= CLIENT_LOCAL_FILES;
        }
        if !self.connection_attributes.is_empty() {
            flags |= CLIENT_CONNECT_ATTRS;
        }
        flags
    }

    /// Check option combinations that can never connect.
    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(config_error("no host configured"));
        }
        if self.max_packet_size < 1024 {
            return Err(config_error("max_packet_size must be at least 1024 bytes"));
        }
        if self.tls.client_cert_path.is_some() != self.tls.client_key_path.is_some() {
            return Err(config_error(
                "client certificate and client key must be configured together",
            ));
        }
        Ok(())
    }
}

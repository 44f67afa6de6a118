//! Server-reported and client-requested session state.

use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;

use crate::config::IsolationLevel;
use crate::protocol::server_status::{
    SERVER_STATUS_AUTOCOMMIT, SERVER_STATUS_IN_TRANS, SERVER_STATUS_IN_TRANS_READONLY,
};
use crate::protocol::{OkPacket, SessionChange, capabilities};

/// Bits recording which session facets were changed from their configured
/// defaults and must be carried over to a replacement session.
pub mod state_flags {
    pub const AUTOCOMMIT: u8 = 1;
    pub const DATABASE: u8 = 2;
    pub const NETWORK_TIMEOUT: u8 = 4;
    pub const TX_ISOLATION: u8 = 8;
    pub const READ_ONLY: u8 = 16;
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// TCP connect in progress
    Connecting,
    /// Capability exchange, TLS and authentication
    Handshaking,
    /// Accepting commands
    Ready,
    /// A transport or protocol failure left the stream unusable
    Broken,
    /// Closed or aborted by the caller
    Closed,
}

/// `major.minor.patch` as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ServerVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl ServerVersion {
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse the leading numeric components of a version string such as
    /// `8.5.1` or `5.7.32-log`. Missing components count as 0.
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = [0u16; 3];
        let mut seen = 0;
        for (slot, piece) in parts.iter_mut().zip(text.trim().split('.')) {
            let digits: String = piece.chars().take_while(char::is_ascii_digit).collect();
            if digits.is_empty() {
                break;
            }
            *slot = digits.parse().ok()?;
            seen += 1;
            if digits.len() != piece.len() {
                break;
            }
        }
        (seen > 0).then(|| Self::new(parts[0], parts[1], parts[2]))
    }

    pub fn at_least(&self, major: u16, minor: u16, patch: u16) -> bool {
        *self >= Self::new(major, minor, patch)
    }
}

impl PartialOrd for ServerVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ServerVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// What the session knows about itself.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub(crate) thread_id: u32,
    pub(crate) server_version: String,
    pub(crate) capabilities: u64,
    pub(crate) charset: u8,
    pub(crate) secure: bool,
    status_flags: u16,
    warnings: u16,
    database: Option<String>,
    autocommit: bool,
    isolation: Option<IsolationLevel>,
    read_only: bool,
    network_timeout: Option<Duration>,
    state_changes: u8,
}

impl SessionContext {
    pub(crate) fn new(thread_id: u32, server_version: String, capabilities: u64, charset: u8) -> Self {
        Self {
            thread_id,
            server_version,
            capabilities,
            charset,
            secure: false,
            status_flags: SERVER_STATUS_AUTOCOMMIT,
            warnings: 0,
            database: None,
            autocommit: true,
            isolation: None,
            read_only: false,
            network_timeout: None,
            state_changes: 0,
        }
    }

    /// Server connection id, the target of `KILL`.
    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    /// Version string from the greeting.
    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Negotiated capability set.
    pub fn capabilities(&self) -> u64 {
        self.capabilities
    }

    /// Collation id the connection was opened with.
    pub fn charset(&self) -> u8 {
        self.charset
    }

    pub fn has_capability(&self, flag: u64) -> bool {
        self.capabilities & flag != 0
    }

    pub fn deprecate_eof(&self) -> bool {
        self.has_capability(capabilities::CLIENT_DEPRECATE_EOF)
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn status_flags(&self) -> u16 {
        self.status_flags
    }

    /// Warning count of the last completed command.
    pub fn warnings(&self) -> u16 {
        self.warnings
    }

    pub fn in_transaction(&self) -> bool {
        self.status_flags & SERVER_STATUS_IN_TRANS != 0
    }

    pub fn in_read_only_transaction(&self) -> bool {
        self.status_flags & SERVER_STATUS_IN_TRANS_READONLY != 0
    }

    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    pub fn autocommit(&self) -> bool {
        self.autocommit
    }

    pub fn isolation(&self) -> Option<IsolationLevel> {
        self.isolation
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn network_timeout(&self) -> Option<Duration> {
        self.network_timeout
    }

    /// Facets changed away from their configured defaults.
    pub fn state_changes(&self) -> u8 {
        self.state_changes
    }

    pub fn has_changed(&self, flag: u8) -> bool {
        self.state_changes & flag != 0
    }

    pub(crate) fn mark_changed(&mut self, flag: u8) {
        self.state_changes |= flag;
    }

    pub(crate) fn reset_changes(&mut self) {
        self.state_changes = 0;
    }

    pub(crate) fn set_database(&mut self, database: Option<String>) {
        self.database = database;
    }

    pub(crate) fn set_isolation(&mut self, level: Option<IsolationLevel>) {
        self.isolation = level;
    }

    pub(crate) fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    pub(crate) fn set_network_timeout(&mut self, timeout: Option<Duration>) {
        self.network_timeout = timeout;
    }

    pub(crate) fn apply_status(&mut self, status_flags: u16, warnings: u16) {
        self.status_flags = status_flags;
        self.warnings = warnings;
        self.autocommit = status_flags & SERVER_STATUS_AUTOCOMMIT != 0;
    }

    /// Absorb an OK packet: status, warnings and tracked state changes.
    pub(crate) fn apply_ok(&mut self, ok: &OkPacket) {
        self.apply_status(ok.status_flags, ok.warnings);
        for change in &ok.session_changes {
            match change {
                SessionChange::Schema(schema) => {
                    tracing::debug!(schema = %schema, "server reported schema change");
                    self.database = (!schema.is_empty()).then(|| schema.clone());
                }
                SessionChange::SystemVariable { name, value }
                    if name.eq_ignore_ascii_case("autocommit") =>
                {
                    self.autocommit = matches!(value.to_ascii_uppercase().as_str(), "ON" | "1");
                }
                _ => {}
            }
        }
    }
}

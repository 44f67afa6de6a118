//! Wire-protocol client for SingleStore and other MySQL-family servers.
//!
//! The crate speaks the protocol directly over a blocking TCP (or TLS)
//! transport. It provides:
//!
//! - Packet framing with sequence numbers and optional zlib compression
//! - Authentication through an explicit plugin registry
//!   (mysql_native_password, caching_sha2_password, sha256_password,
//!   mysql_clear_password)
//! - Text and binary protocols, with per-column decoding on access
//! - A bounded LRU cache of server-side prepared statements
//! - Streaming result cursors with a fetch window
//! - Pipelined command batches
//! - Failover across hosts with transaction replay
//!
//! # Layers
//!
//! [`Session`] owns one physical connection. [`Client`] presents one
//! logical session over a list of candidate hosts and replaces the
//! session when the transport fails.
//!
//! # Example
//!
//! ```rust,ignore
//! use s2wire::{Client, Config, QueryOptions};
//! use s2wire_core::Value;
//!
//! let config = Config::from_url("s2://app:secret@node1:3306,node2:3306/shop")?
//!     .transaction_replay(true);
//! let mut client = Client::connect(config)?;
//!
//! client.execute("INSERT INTO t VALUES (?, ?)", &[Value::Int(5), Value::Int(10)])?;
//!
//! let mut rows = client
//!     .query_with("SELECT * FROM t", QueryOptions::new().fetch_size(100))?
//!     .into_rows()
//!     .expect("rows");
//! while rows.next()? {
//!     let a: Option<i64> = rows.row().expect("row").get(0)?;
//! }
//! ```

pub mod auth;
pub mod cache;
pub mod config;
pub mod ha;
pub mod protocol;
pub mod result;
pub mod session;
pub mod tls;
pub mod types;

pub use auth::{AuthContext, AuthPlugin, AuthRegistry};
pub use cache::{PrepareCache, PreparedHandle};
pub use config::{Config, IsolationLevel, SslMode, TlsConfig};
pub use ha::{Client, HostAddress, HostRegistry, HostRole, HostSelection, TransactionReplayLog};
pub use protocol::ClientMessage;
pub use result::{CursorType, QueryResult, ResultSet, RowView, UpdateCount};
pub use session::{AbortHandle, QueryOptions, ServerVersion, Session, SessionContext, SessionState};
pub use types::{ColumnDescriptor, FromColumn, Vector};

pub use s2wire_core::{Error, Result, Row, Value};

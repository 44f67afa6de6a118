//! Core types for s2wire.
//!
//! This crate holds the driver-agnostic pieces shared by the protocol engine
//! and its callers:
//!
//! - `Error` and its per-family payloads
//! - `Value`, the dynamically typed SQL value used for parameters
//! - `Row`, a fully decoded result row

pub mod error;
pub mod row;
pub mod value;

pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, DecodeError, DecodeErrorKind, Error,
    ProtocolError, ProtocolErrorKind, QueryError, QueryErrorKind, Result,
};
pub use row::{ColumnInfo, Row};
pub use value::Value;

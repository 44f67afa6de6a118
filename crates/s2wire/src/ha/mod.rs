//! High availability: candidate hosts, the shared host registry, the
//! transaction replay log and the failover [`Client`].

mod client;
mod hosts;
mod replay;

pub use client::Client;
pub use hosts::{ConnectPlan, HostAddress, HostRegistry, HostRole, HostSelection};
pub use replay::TransactionReplayLog;

//! Candidate hosts and the shared host registry.
//!
//! The registry holds the state every coordinator over the same host set
//! shares: the deny list, the round-robin cursor, per-host session counts
//! and when each host last accepted a session. All of it is lock-free; a
//! briefly stale view only costs one more failed connect.

use std::cmp::Reverse;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Role of a host in a primary/replica topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HostRole {
    #[default]
    Primary,
    Replica,
}

/// One candidate server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostAddress {
    pub host: String,
    pub port: u16,
    pub role: HostRole,
}

impl HostAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            role: HostRole::Primary,
        }
    }

    pub fn with_role(mut self, role: HostRole) -> Self {
        self.role = role;
        self
    }

    pub fn is_replica(&self) -> bool {
        self.role == HostRole::Replica
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Order in which candidate hosts are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostSelection {
    /// Configured order.
    #[default]
    Sequential,
    /// Rotate the starting host on every connect.
    RoundRobin,
    /// Fewest open sessions first.
    LeastConnections,
    /// Replicas first for read-only intent, primaries otherwise.
    PrimaryReplica,
}

impl HostSelection {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().replace('-', "_").as_str() {
            "sequential" | "failover" => Some(HostSelection::Sequential),
            "round_robin" | "roundrobin" | "loadbalance" | "load_balance" => {
                Some(HostSelection::RoundRobin)
            }
            "least_connections" | "leastconnections" => Some(HostSelection::LeastConnections),
            "primary_replica" | "replication" => Some(HostSelection::PrimaryReplica),
            _ => None,
        }
    }
}

/// Hosts to try for one connection attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectPlan {
    /// Hosts not currently denied, in policy order
    pub available: Vec<HostAddress>,
    /// Denied hosts, soonest expiry first
    pub denied: Vec<HostAddress>,
}

/// Shared deny list, selection cursor and load counters.
#[derive(Debug, Default)]
pub struct HostRegistry {
    denied: DashMap<HostAddress, Instant>,
    load: DashMap<HostAddress, usize>,
    connected_at: DashMap<HostAddress, Instant>,
    cursor: AtomicUsize,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry used when none is injected.
    pub fn global() -> Arc<HostRegistry> {
        static GLOBAL: OnceLock<Arc<HostRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(HostRegistry::new())))
    }

    /// Deny `host` for `duration`.
    pub fn deny(&self, host: &HostAddress, duration: Duration) {
        tracing::warn!(host = %host, ?duration, "denying host");
        self.denied.insert(host.clone(), Instant::now() + duration);
    }

    /// Lift a denial, e.g. after a successful connect.
    pub fn allow(&self, host: &HostAddress) {
        self.denied.remove(host);
    }

    /// Denial expiry, dropping the entry once it has elapsed.
    pub fn denied_until(&self, host: &HostAddress) -> Option<Instant> {
        let now = Instant::now();
        let until = *self.denied.get(host)?;
        if until > now {
            return Some(until);
        }
        self.denied.remove_if(host, |_, until| *until <= now);
        None
    }

    pub fn is_denied(&self, host: &HostAddress) -> bool {
        self.denied_until(host).is_some()
    }

    /// Open sessions currently attached to `host`.
    pub fn load(&self, host: &HostAddress) -> usize {
        self.load.get(host).map_or(0, |n| *n)
    }

    /// When a session to `host` was last established.
    pub fn last_connected(&self, host: &HostAddress) -> Option<Instant> {
        self.connected_at.get(host).map(|at| *at)
    }

    /// Record a successful connect: lift any denial and count the session.
    pub(crate) fn connected(&self, host: &HostAddress) {
        self.denied.remove(host);
        self.connected_at.insert(host.clone(), Instant::now());
        self.attach(host);
    }

    pub(crate) fn attach(&self, host: &HostAddress) {
        *self.load.entry(host.clone()).or_insert(0) += 1;
    }

    pub(crate) fn detach(&self, host: &HostAddress) {
        if let Some(mut n) = self.load.get_mut(host) {
            *n = n.saturating_sub(1);
        }
    }

    /// Order `hosts` for a connection attempt.
    pub fn plan(&self, hosts: &[HostAddress], selection: HostSelection, read_only: bool) -> ConnectPlan {
        let mut available = Vec::with_capacity(hosts.len());
        let mut denied = Vec::new();
        for host in hosts {
            match self.denied_until(host) {
                Some(until) => denied.push((until, host.clone())),
                None => available.push(host.clone()),
            }
        }
        denied.sort_by_key(|(until, _)| *until);

        match selection {
            HostSelection::Sequential => {}
            HostSelection::RoundRobin => self.rotate(&mut available),
            HostSelection::LeastConnections => available.sort_by_key(|h| self.load(h)),
            HostSelection::PrimaryReplica => {
                let (mut preferred, mut others): (Vec<_>, Vec<_>) = available
                    .into_iter()
                    .partition(|h| h.is_replica() == read_only);
                if read_only {
                    self.rotate(&mut preferred);
                }
                preferred.append(&mut others);
                available = preferred;
                denied.sort_by_key(|(until, h)| (Reverse(h.is_replica() == read_only), *until));
            }
        }

        ConnectPlan {
            available,
            denied: denied.into_iter().map(|(_, h)| h).collect(),
        }
    }

    fn rotate(&self, hosts: &mut [HostAddress]) {
        if hosts.len() > 1 {
            let start = self.cursor.fetch_add(1, Ordering::Relaxed) % hosts.len();
            hosts.rotate_left(start);
        }
    }
}

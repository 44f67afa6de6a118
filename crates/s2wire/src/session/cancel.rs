//! Out-of-band cancellation: the query timeout timer and `abort`.
//!
//! Both work by opening a short-lived side session to the same host and
//! issuing `KILL [QUERY] <thread id>`. The primary transport is never read
//! from another thread.

use std::fmt;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use s2wire_core::Result;

use super::Session;
use crate::config::Config;
use crate::ha::HostAddress;

/// Where a `KILL` has to be sent.
#[derive(Clone)]
pub(crate) struct KillTarget {
    pub config: Arc<Config>,
    pub host: HostAddress,
    pub thread_id: u32,
}

impl fmt::Debug for KillTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KillTarget")
            .field("host", &self.host)
            .field("thread_id", &self.thread_id)
            .finish_non_exhaustive()
    }
}

/// Kill the running statement (`query_only`) or the whole connection.
pub(crate) fn kill(target: &KillTarget, query_only: bool) -> Result<()> {
    let mut side = (*target.config).clone();
    side.query_timeout = None;
    side.database = None;
    side.autocommit = true;
    side.transaction_isolation = None;
    side.enable_extended_data_types = false;

    let sql = if query_only {
        format!("KILL QUERY {}", target.thread_id)
    } else {
        format!("KILL {}", target.thread_id)
    };
    let mut session = Session::connect(Arc::new(side), &target.host)?;
    session.execute_simple(&sql)?;
    session.close()
}

/// Fires `KILL QUERY` if not dropped within the timeout.
#[derive(Debug)]
pub(crate) struct QueryTimer {
    _cancel: Sender<()>,
    fired: Arc<AtomicBool>,
}

impl QueryTimer {
    pub(crate) fn start(target: KillTarget, timeout: Duration) -> Option<Self> {
        let (tx, rx) = mpsc::channel::<()>();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let spawned = thread::Builder::new()
            .name("s2wire-query-timeout".to_owned())
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(timeout) {
                    flag.store(true, Ordering::Release);
                    tracing::warn!(
                        host = %target.host,
                        thread_id = target.thread_id,
                        ?timeout,
                        "query timeout elapsed, cancelling statement"
                    );
                    if let Err(e) = kill(&target, true) {
                        tracing::warn!(error = %e, "KILL QUERY failed");
                    }
                }
            });
        match spawned {
            Ok(_) => Some(Self {
                _cancel: tx,
                fired,
            }),
            Err(e) => {
                tracing::warn!(error = %e, "cannot start query timeout timer");
                None
            }
        }
    }

    /// Did the timeout elapse before the command finished?
    pub(crate) fn fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

/// State shared between a session and its abort handles.
pub(crate) struct Shared {
    closed: AtomicBool,
    busy: AtomicBool,
    socket: Option<TcpStream>,
    pub(crate) target: KillTarget,
}

impl Shared {
    pub(crate) fn new(socket: Option<TcpStream>, target: KillTarget) -> Self {
        Self {
            closed: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            socket,
            target,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns true for the call that actually closed.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::Release);
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub(crate) fn socket(&self) -> Option<&TcpStream> {
        self.socket.as_ref()
    }

    pub(crate) fn shutdown(&self) {
        if let Some(socket) = &self.socket {
            if let Err(e) = socket.shutdown(Shutdown::Both) {
                tracing::debug!(error = %e, "socket shutdown");
            }
        }
    }

    fn abort(&self) {
        if !self.mark_closed() {
            return;
        }
        tracing::debug!(thread_id = self.target.thread_id, busy = self.is_busy(), "aborting session");
        if self.is_busy() {
            let target = self.target.clone();
            let spawned = thread::Builder::new()
                .name("s2wire-abort".to_owned())
                .spawn(move || {
                    if let Err(e) = kill(&target, false) {
                        tracing::warn!(error = %e, thread_id = target.thread_id, "KILL on abort failed");
                    }
                });
            if let Err(e) = spawned {
                tracing::warn!(error = %e, "cannot start abort thread");
            }
        }
        self.shutdown();
    }
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("closed", &self.is_closed())
            .field("busy", &self.is_busy())
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// Tears a session down from another thread.
///
/// Aborting never blocks: a session busy with a command gets a `KILL` from
/// a background side connection, and its socket is shut down right away so
/// the blocked reader fails. Only the first abort or close has effect.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    pub(crate) shared: Arc<Shared>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.shared.abort();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn thread_id(&self) -> u32 {
        self.shared.target.thread_id
    }
}

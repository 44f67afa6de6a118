//! One logical session over a set of candidate hosts.
//!
//! [`Client`] keeps a single live [`Session`] and replaces it when the
//! transport fails. Replacing a session denies the failed host, connects to
//! the next candidate, carries over the session settings the caller changed
//! and then decides what happens to the open transaction:
//!
//! - no transaction: the failed command is reported as
//!   `TransientReconnected` and not retried;
//! - replay enabled and the log intact: the logged commands run again on
//!   the new session, then the failed command runs once more;
//! - a failed COMMIT is never retried, its outcome is unknown;
//! - a failed ROLLBACK succeeds, the new session has no transaction;
//! - otherwise the transaction is reported lost.

use std::sync::Arc;
use std::time::Duration;

use s2wire_core::{ConnectionErrorKind, Error, Result, Value};

use super::hosts::{HostAddress, HostRegistry, HostSelection};
use super::replay::TransactionReplayLog;
use crate::config::{Config, IsolationLevel};
use crate::protocol::ClientMessage;
use crate::result::{QueryResult, UpdateCount};
use crate::session::{AbortHandle, Pending, QueryOptions, Session, SessionContext, SessionState, state_flags};

/// Failover coordinator presenting one session over many hosts.
pub struct Client {
    config: Arc<Config>,
    registry: Arc<HostRegistry>,
    session: Option<Session>,
    replay: TransactionReplayLog,
    read_only: bool,
    closed: bool,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("host", &self.current_host())
            .field("replay_len", &self.replay.len())
            .field("replay_dirty", &self.replay.is_dirty())
            .field("read_only", &self.read_only)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

fn closed_error() -> Error {
    Error::connection(ConnectionErrorKind::Closed, "client is closed")
}

fn transient(message: impl Into<String>) -> Error {
    Error::connection(ConnectionErrorKind::TransientReconnected, message)
}

fn lost(message: impl Into<String>) -> Error {
    Error::connection(ConnectionErrorKind::TransactionLost, message)
}

/// Errors no other host will fix.
fn stops_host_search(err: &Error) -> bool {
    matches!(err, Error::Config(_))
        || matches!(
            err,
            Error::Connection(c) if c.kind == ConnectionErrorKind::Authentication
        )
}

/// Run one command on `session`. Executes are resolved through the
/// session's prepare cache, so a replayed execute gets a fresh statement id.
fn dispatch(session: &mut Session, message: &ClientMessage, options: QueryOptions) -> Result<Pending> {
    match message {
        ClientMessage::Query(sql) => session.start_query(sql, options),
        ClientMessage::Execute { sql, params, .. } => session.start_execute(sql, params, options),
        other => session.start(other, options, None, None),
    }
}

impl Client {
    /// Connect using the process-wide host registry.
    pub fn connect(config: Config) -> Result<Self> {
        Self::connect_with_registry(config, HostRegistry::global())
    }

    /// Connect sharing deny list and load counters through `registry`.
    pub fn connect_with_registry(config: Config, registry: Arc<HostRegistry>) -> Result<Self> {
        config.validate()?;
        let mut client = Client {
            replay: TransactionReplayLog::new(config.transaction_replay_size),
            config: Arc::new(config),
            registry,
            session: None,
            read_only: false,
            closed: false,
        };
        let session = client.open_session()?;
        client.session = Some(session);
        Ok(client)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<HostRegistry> {
        &self.registry
    }

    /// The live session, if any.
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn current_host(&self) -> Option<&HostAddress> {
        self.session.as_ref().map(Session::host)
    }

    pub fn context(&self) -> Option<&SessionContext> {
        self.session.as_ref().map(Session::context)
    }

    pub fn replay_log(&self) -> &TransactionReplayLog {
        &self.replay
    }

    pub fn in_transaction(&self) -> bool {
        self.session.as_ref().is_some_and(Session::in_transaction)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn abort_handle(&self) -> Option<AbortHandle> {
        self.session.as_ref().map(Session::abort_handle)
    }

    // ---- connecting ----

    /// Try the non-denied hosts `retries_all_down + 1` times over, then the
    /// denied ones by ascending expiry.
    fn open_session(&self) -> Result<Session> {
        let plan = self
            .registry
            .plan(&self.config.hosts, self.config.host_selection, self.read_only);
        let mut last_error = None;
        let rounds = if plan.available.is_empty() {
            0
        } else {
            self.config.retries_all_down + 1
        };

        for round in 0..rounds {
            if round > 0 {
                tracing::debug!(round, "retrying hosts");
            }
            for host in &plan.available {
                match self.try_host(host) {
                    Ok(session) => return Ok(session),
                    Err(e) if stops_host_search(&e) => return Err(e),
                    Err(e) => last_error = Some(e),
                }
            }
        }
        for host in &plan.denied {
            tracing::debug!(host = %host, "trying denied host");
            match self.try_host(host) {
                Ok(session) => return Ok(session),
                Err(e) if stops_host_search(&e) => return Err(e),
                Err(e) => last_error = Some(e),
            }
        }

        let detail = last_error.map_or_else(|| "no candidate host".to_string(), |e| e.to_string());
        Err(Error::connection(
            ConnectionErrorKind::AllHostsDown,
            format!("no host of {} reachable: {}", self.config.hosts.len(), detail),
        ))
    }

    fn try_host(&self, host: &HostAddress) -> Result<Session> {
        match Session::connect(Arc::clone(&self.config), host) {
            Ok(session) => {
                self.registry.connected(host);
                Ok(session)
            }
            Err(e) => {
                tracing::debug!(host = %host, error = %e, "connect failed");
                if !stops_host_search(&e) {
                    self.registry.deny(host, self.config.deny_timeout);
                }
                Err(e)
            }
        }
    }

    /// Carry the settings the caller changed on `old` over to `session`.
    fn resync(session: &mut Session, old: &SessionContext) -> Result<()> {
        if old.state_changes() == 0 {
            return Ok(());
        }
        tracing::debug!(changes = old.state_changes(), "resynchronizing session state");
        if old.has_changed(state_flags::AUTOCOMMIT) {
            session.set_autocommit(old.autocommit())?;
        }
        if old.has_changed(state_flags::DATABASE) {
            if let Some(db) = old.database() {
                session.set_database(db)?;
            }
        }
        if old.has_changed(state_flags::NETWORK_TIMEOUT) {
            session.set_network_timeout(old.network_timeout())?;
        }
        if old.has_changed(state_flags::TX_ISOLATION) {
            if let Some(level) = old.isolation() {
                session.set_transaction_isolation(level)?;
            }
        }
        if old.has_changed(state_flags::READ_ONLY) {
            session.set_read_only(old.read_only())?;
        }
        Ok(())
    }

    /// Replace the session after a transport failure.
    ///
    /// With `replay` the logged transaction runs again on the new session.
    /// Returns the new session's error when the transaction cannot be
    /// restored.
    fn recover(&mut self, in_transaction: bool, replay: bool) -> Result<()> {
        let Some(old) = self.session.take() else {
            return Err(closed_error());
        };
        let failed = old.host().clone();
        let old_ctx = old.context().clone();
        self.registry.deny(&failed, self.config.deny_timeout);
        self.registry.detach(&failed);
        drop(old);

        let mut session = self.open_session()?;
        tracing::info!(from = %failed, to = %session.host(), "reconnected after failure");
        let res = Self::resync(&mut session, &old_ctx);
        self.session = Some(session);
        res?;

        if !in_transaction || !replay {
            self.replay.clear();
            return Ok(());
        }
        if !self.config.transaction_replay || self.replay.is_dirty() {
            self.replay.clear();
            tracing::warn!(host = %failed, "transaction lost on failover");
            return Err(lost("connection lost during a transaction that cannot be replayed"));
        }
        self.replay_transaction()
    }

    fn replay_transaction(&mut self) -> Result<()> {
        let entries = self.replay.entries().to_vec();
        let Some(session) = self.session.as_mut() else {
            return Err(closed_error());
        };
        tracing::info!(commands = entries.len(), host = %session.host(), "replaying transaction");
        for message in &entries {
            if let Err(e) = dispatch(session, message, QueryOptions::new().fetch_size(0)) {
                tracing::warn!(command = message.name(), error = %e, "transaction replay failed");
                self.replay.clear();
                return Err(lost(format!("transaction replay failed: {}", e)));
            }
        }
        tracing::info!(commands = entries.len(), "transaction replayed");
        Ok(())
    }

    /// The live session, replacing a broken one first.
    fn active(&mut self) -> Result<&mut Session> {
        if self.closed {
            return Err(closed_error());
        }
        let state = self.session.as_ref().map(Session::state);
        match state {
            None => {
                let session = self.open_session()?;
                self.session = Some(session);
            }
            Some(SessionState::Closed) => {
                tracing::debug!("session was aborted; client closed");
                self.closed = true;
                self.replay.clear();
                return Err(closed_error());
            }
            Some(SessionState::Broken) => {
                let in_transaction = self.in_transaction();
                self.recover(in_transaction, true)?;
            }
            Some(_) => {}
        }
        self.session.as_mut().ok_or_else(closed_error)
    }

    fn track(&mut self, message: &ClientMessage) {
        if self.in_transaction() {
            self.replay.record(message);
        } else {
            self.replay.clear();
        }
    }

    /// Run `message` with failover.
    fn run(&mut self, message: &ClientMessage, options: QueryOptions) -> Result<Pending> {
        let session = self.active()?;
        let in_transaction = session.in_transaction();
        match dispatch(session, message, options) {
            Ok(pending) => {
                self.track(message);
                Ok(pending)
            }
            Err(e) if e.requires_reconnect() && !self.aborted() => self.fail_over(message, options, e, in_transaction),
            Err(e) => Err(e),
        }
    }

    fn aborted(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.state() == SessionState::Closed)
    }

    fn fail_over(&mut self, message: &ClientMessage, options: QueryOptions, cause: Error, in_transaction: bool) -> Result<Pending> {
        tracing::warn!(command = message.name(), error = %cause, in_transaction, "command failed on transport");

        if in_transaction && message.is_commit() {
            self.recover(true, false)?;
            return Err(transient(format!("connection lost during COMMIT, outcome unknown: {}", cause)));
        }
        if in_transaction && message.is_rollback() {
            self.recover(true, false)?;
            return Ok(Pending::Update(UpdateCount::default()));
        }
        self.recover(in_transaction, true)?;
        if !in_transaction {
            return Err(transient(format!("connection re-established after failure: {}", cause)));
        }

        let session = self.session.as_mut().ok_or_else(closed_error)?;
        match dispatch(session, message, options) {
            Ok(pending) => {
                self.track(message);
                Ok(pending)
            }
            Err(e) if e.requires_reconnect() => {
                self.replay.clear();
                Err(lost(format!("connection lost again after transaction replay: {}", e)))
            }
            Err(e) => Err(e),
        }
    }

    fn finish(&mut self, pending: Pending) -> Result<QueryResult<'_>> {
        match self.session.as_mut() {
            Some(session) => session.finish(pending),
            None => Err(closed_error()),
        }
    }

    /// Run a settings change, reconnecting once if the transport failed.
    fn with_session<T>(&mut self, mut op: impl FnMut(&mut Session) -> Result<T>) -> Result<T> {
        let session = self.active()?;
        let in_transaction = session.in_transaction();
        match op(session) {
            Err(e) if e.requires_reconnect() && !self.aborted() => {
                self.recover(in_transaction, true)?;
                let session = self.session.as_mut().ok_or_else(closed_error)?;
                op(session)
            }
            res => res,
        }
    }

    // ---- commands ----

    pub fn query(&mut self, sql: &str) -> Result<QueryResult<'_>> {
        self.query_with(sql, QueryOptions::default())
    }

    pub fn query_with(&mut self, sql: &str, options: QueryOptions) -> Result<QueryResult<'_>> {
        let pending = self.run(&ClientMessage::Query(sql.to_string()), options)?;
        self.finish(pending)
    }

    pub fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult<'_>> {
        self.execute_with(sql, params, QueryOptions::default())
    }

    pub fn execute_with(&mut self, sql: &str, params: &[Value], options: QueryOptions) -> Result<QueryResult<'_>> {
        // The id is assigned by whichever session runs the statement.
        let message = ClientMessage::Execute {
            statement_id: 0,
            sql: sql.to_string(),
            params: params.to_vec(),
        };
        let pending = self.run(&message, options)?;
        self.finish(pending)
    }

    /// Run commands pipelined on the current session.
    ///
    /// A transport failure inside the batch is not retried; the next
    /// command reconnects, and an open transaction is then reported lost.
    pub fn pipeline(&mut self, commands: &[ClientMessage]) -> Result<Vec<Result<QueryResult<'static>>>> {
        let session = self.active()?;
        let results = session.pipeline(commands);
        let fatal = results.iter().any(|r| r.as_ref().is_err_and(|e| e.requires_reconnect()));
        if fatal {
            self.replay.invalidate();
            return Ok(results);
        }
        for (message, res) in commands.iter().zip(&results) {
            if res.is_ok() {
                self.track(message);
            }
        }
        Ok(results)
    }

    pub fn execute_batch(&mut self, sql: &str, param_sets: &[Vec<Value>]) -> Result<Vec<Result<UpdateCount>>> {
        let session = self.active()?;
        let results = session.execute_batch(sql, param_sets)?;
        if results.iter().any(|r| r.as_ref().is_err_and(|e| e.requires_reconnect())) {
            self.replay.invalidate();
            return Ok(results);
        }
        for (params, res) in param_sets.iter().zip(&results) {
            if res.is_ok() {
                self.track(&ClientMessage::Execute {
                    statement_id: 0,
                    sql: sql.to_string(),
                    params: params.clone(),
                });
            }
        }
        Ok(results)
    }

    pub fn begin(&mut self) -> Result<()> {
        self.query_with("BEGIN", QueryOptions::new().fetch_size(0)).map(|_| ())
    }

    pub fn commit(&mut self) -> Result<()> {
        self.query_with("COMMIT", QueryOptions::new().fetch_size(0)).map(|_| ())
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.query_with("ROLLBACK", QueryOptions::new().fetch_size(0)).map(|_| ())
    }

    pub fn ping(&mut self) -> Result<()> {
        self.with_session(Session::ping)
    }

    // ---- session state ----

    pub fn set_autocommit(&mut self, autocommit: bool) -> Result<()> {
        self.with_session(|s| s.set_autocommit(autocommit))
    }

    pub fn set_database(&mut self, database: &str) -> Result<()> {
        self.with_session(|s| s.set_database(database))
    }

    pub fn set_network_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.with_session(|s| s.set_network_timeout(timeout))
    }

    pub fn set_transaction_isolation(&mut self, level: IsolationLevel) -> Result<()> {
        self.with_session(|s| s.set_transaction_isolation(level))
    }

    /// Declare read-only or read-write intent.
    ///
    /// Under primary/replica selection this moves to a host of the
    /// preferred role when one is available and no transaction is open.
    pub fn set_read_only(&mut self, read_only: bool) -> Result<()> {
        self.read_only = read_only;
        if self.config.host_selection == HostSelection::PrimaryReplica && !self.in_transaction() {
            self.switch_role(read_only)?;
        }
        self.with_session(|s| s.set_read_only(read_only))
    }

    fn switch_role(&mut self, read_only: bool) -> Result<()> {
        let Some(current) = self.current_host().cloned() else {
            return Ok(());
        };
        if current.is_replica() == read_only {
            return Ok(());
        }
        let plan = self
            .registry
            .plan(&self.config.hosts, HostSelection::PrimaryReplica, read_only);
        if !plan.available.first().is_some_and(|h| h.is_replica() == read_only) {
            return Ok(());
        }
        let mut session = match self.open_session() {
            Ok(session) => session,
            Err(e) => {
                tracing::debug!(error = %e, "staying on {} after role switch failed", current);
                return Ok(());
            }
        };
        if let Some(mut old) = self.session.take() {
            Self::resync(&mut session, old.context())?;
            self.registry.detach(old.host());
            if let Err(e) = old.close() {
                tracing::debug!(error = %e, "closing session after role switch");
            }
        }
        tracing::debug!(from = %current, to = %session.host(), read_only, "switched host for read intent");
        self.session = Some(session);
        Ok(())
    }

    // ---- teardown ----

    /// Close the session gracefully. Only the first call has effect.
    pub fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.replay.clear();
        match self.session.take() {
            Some(mut session) => {
                self.registry.detach(session.host());
                session.close()
            }
            None => Ok(()),
        }
    }

    /// Tear the session down without the quit exchange. Only the first
    /// call has effect.
    pub fn abort(&mut self) {
        self.closed = true;
        self.replay.clear();
        if let Some(mut session) = self.session.take() {
            self.registry.detach(session.host());
            session.abort();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(session) = &self.session {
            self.registry.detach(session.host());
        }
    }
}

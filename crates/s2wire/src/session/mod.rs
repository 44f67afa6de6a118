//! One session with one server.
//!
//! A [`Session`] owns the framed transport and runs exactly one command
//! exchange at a time. Result rows are either read to the end before the
//! command returns (fetch size 0) or left on the socket and pulled by the
//! returned [`ResultSet`], which borrows the session mutably until it is
//! dropped. Dropping it drains whatever is still unread, so the next
//! command always starts on a clean stream.
//!
//! Any transport or protocol failure marks the session broken; server
//! errors leave it usable.

mod cancel;
mod context;
mod handshake;

use std::fs::File;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use s2wire_core::error::{ConnectionError, ConnectionErrorKind, ProtocolErrorKind};
use s2wire_core::{Error, Result, Value};

pub use cancel::AbortHandle;
pub use context::{ServerVersion, SessionContext, SessionState, state_flags};

use crate::cache::{CloseQueue, PrepareCache, PreparedHandle};
use crate::config::{Config, IsolationLevel};
use crate::ha::HostAddress;
use crate::protocol::server_status::SERVER_MORE_RESULTS_EXISTS;
use crate::protocol::{
    ClientMessage, ExpectedResponse, Framer, MAX_PACKET_SIZE, OkPacket, PacketReader, capabilities,
};
use crate::result::{CursorType, FetchBatch, MAX_FETCH_BATCH, QueryResult, ResultSet, RowFetcher, UpdateCount};
use crate::types::column::Columns;
use crate::types::encode::{self, is_long_data, long_data_bytes};
use crate::types::{ColumnDescriptor, Encoding};

use cancel::{KillTarget, QueryTimer, Shared};

/// Server error: unknown prepared statement handler.
const ER_UNKNOWN_STMT_HANDLER: u16 = 1243;

/// Bytes per LOAD DATA LOCAL packet.
const LOCAL_INFILE_CHUNK: usize = 64 * 1024;

/// Extended column metadata needs at least this server version.
const EXTENDED_TYPES_MIN_VERSION: ServerVersion = ServerVersion::new(8, 5, 0);

/// How the rows of one command are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryOptions {
    /// Rows per fetch; `None` uses the configured default, 0 materializes.
    pub fetch_size: Option<usize>,
    pub cursor_type: CursorType,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fetch_size(mut self, rows: usize) -> Self {
        self.fetch_size = Some(rows);
        self
    }

    pub fn cursor_type(mut self, cursor_type: CursorType) -> Self {
        self.cursor_type = cursor_type;
        self
    }

    pub fn scrollable(self) -> Self {
        self.cursor_type(CursorType::Scrollable)
    }

    fn materialized() -> Self {
        Self::new().fetch_size(0)
    }
}

/// A command's outcome read as far as possible without borrowing the
/// session; [`Session::finish`] turns it into a [`QueryResult`].
#[derive(Debug)]
pub(crate) enum Pending {
    Update(UpdateCount),
    Rows {
        columns: Columns,
        encoding: Encoding,
        cursor_type: CursorType,
        fetch_size: usize,
        /// `None` while the rows are still on the socket
        rows: Option<Vec<Vec<u8>>>,
    },
}

/// First packet(s) of a response.
enum Head {
    Ok(OkPacket),
    Rows(Columns),
}

/// One row packet or the terminator of the result.
enum RowPacket {
    Row(Vec<u8>),
    End { status_flags: u16 },
}

pub struct Session {
    framer: Framer,
    config: Arc<Config>,
    host: HostAddress,
    ctx: SessionContext,
    state: SessionState,
    cache: PrepareCache,
    close_queue: CloseQueue,
    shared: Arc<Shared>,
    /// Rows of a streamed result are still unread
    streaming: bool,
    /// Row read past the end of the last fetch batch
    lookahead: Option<Vec<u8>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.host)
            .field("thread_id", &self.ctx.thread_id)
            .field("state", &self.state())
            .field("streaming", &self.streaming)
            .field("cached_statements", &self.cache.len())
            .finish_non_exhaustive()
    }
}

fn closed_error() -> Error {
    Error::connection(ConnectionErrorKind::Closed, "session is closed")
}

fn connect_error(host: &HostAddress, err: std::io::Error) -> Error {
    let kind = if err.kind() == std::io::ErrorKind::ConnectionRefused {
        ConnectionErrorKind::Refused
    } else {
        ConnectionErrorKind::Connect
    };
    Error::Connection(ConnectionError {
        kind,
        message: format!("failed to connect to {}: {}", host, err),
        source: Some(Box::new(err)),
    })
}

fn open_socket(config: &Config, host: &HostAddress) -> Result<TcpStream> {
    let addrs = (host.host.as_str(), host.port).to_socket_addrs().map_err(|e| {
        Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::DnsResolution,
            message: format!("cannot resolve {}: {}", host, e),
            source: Some(Box::new(e)),
        })
    })?;

    let mut last = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, config.connect_timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last = Some(e),
        }
    }
    Err(match last {
        Some(e) => connect_error(host, e),
        None => Error::connection(
            ConnectionErrorKind::DnsResolution,
            format!("{} resolved to no address", host),
        ),
    })
}

fn io_error(context: &str, err: std::io::Error) -> Error {
    crate::protocol::framer::transport_error(context, err)
}

impl Session {
    /// Connect to `host`, authenticate and apply the initial session
    /// settings.
    pub fn connect(config: Arc<Config>, host: &HostAddress) -> Result<Self> {
        config.validate()?;
        tracing::debug!(host = %host, state = ?SessionState::Connecting, "opening session");
        let socket = open_socket(&config, host)?;
        socket.set_nodelay(true).ok();
        socket
            .set_read_timeout(Some(config.connect_timeout))
            .and_then(|()| socket.set_write_timeout(Some(config.connect_timeout)))
            .map_err(|e| io_error("cannot set socket timeout", e))?;
        let control = socket.try_clone().ok();

        let mut framer = Framer::new(Box::new(socket), config.max_packet_size);
        let negotiated = handshake::perform(&mut framer, &config, host)?;
        if negotiated.capabilities & capabilities::CLIENT_COMPRESS != 0 {
            framer.enable_compression();
        }

        let greeting = negotiated.greeting;
        let mut ctx = SessionContext::new(
            greeting.thread_id,
            greeting.server_version,
            negotiated.capabilities,
            config.charset,
        );
        ctx.secure = negotiated.secure;
        ctx.apply_status(greeting.status_flags, 0);
        if negotiated.capabilities & capabilities::CLIENT_CONNECT_WITH_DB != 0 {
            ctx.set_database(config.database.clone());
        }

        if let Some(socket) = &control {
            socket
                .set_read_timeout(config.socket_timeout)
                .and_then(|()| socket.set_write_timeout(config.socket_timeout))
                .map_err(|e| io_error("cannot set socket timeout", e))?;
        }

        let target = KillTarget {
            config: Arc::clone(&config),
            host: host.clone(),
            thread_id: ctx.thread_id,
        };
        let mut session = Session {
            framer,
            cache: PrepareCache::new(config.prepare_cache_size),
            config,
            host: host.clone(),
            ctx,
            state: SessionState::Handshaking,
            close_queue: CloseQueue::default(),
            shared: Arc::new(Shared::new(control, target)),
            streaming: false,
            lookahead: None,
        };
        session.initialize()?;
        session.state = SessionState::Ready;
        tracing::info!(
            host = %session.host,
            thread_id = session.ctx.thread_id,
            server_version = %session.ctx.server_version,
            secure = session.ctx.secure,
            compressed = session.framer.is_compressed(),
            "connected"
        );
        Ok(session)
    }

    /// Settings applied right after authentication.
    fn initialize(&mut self) -> Result<()> {
        if let Some(db) = self.config.database.clone() {
            if self.ctx.database() != Some(db.as_str()) {
                self.run_ok(&ClientMessage::InitDb(db.clone()))?;
                self.ctx.set_database(Some(db));
            }
        }
        if !self.config.autocommit {
            self.execute_simple("SET autocommit=0")?;
        }
        if let Some(level) = self.config.transaction_isolation {
            self.execute_simple(&format!(
                "SET SESSION TRANSACTION ISOLATION LEVEL {}",
                level.as_sql()
            ))?;
            self.ctx.set_isolation(Some(level));
        }
        if self.config.enable_extended_data_types {
            self.enable_extended_types()?;
        }
        Ok(())
    }

    fn enable_extended_types(&mut self) -> Result<()> {
        let pending = self.start(
            &ClientMessage::Query("SELECT @@memsql_version".to_string()),
            QueryOptions::materialized(),
            None,
            None,
        );
        let version = match pending {
            Ok(pending) => match Self::finish_owned(pending)?.into_rows() {
                Some(mut rs) => {
                    if rs.next()? {
                        rs.row()
                            .and_then(|row| row.get::<String>(0).ok().flatten())
                            .and_then(|v| ServerVersion::parse(&v))
                    } else {
                        None
                    }
                }
                _ => None,
            },
            Err(e) if !e.requires_reconnect() => {
                tracing::debug!(error = %e, "server does not report @@memsql_version");
                None
            }
            Err(e) => return Err(e),
        };
        match version {
            Some(v) if v >= EXTENDED_TYPES_MIN_VERSION => {
                tracing::debug!(version = %v, "enabling extended type metadata");
                self.execute_simple("SET SESSION enable_extended_types_metadata = on")
            }
            other => {
                tracing::debug!(version = ?other, "extended type metadata not supported");
                Ok(())
            }
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn host(&self) -> &HostAddress {
        &self.host
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn thread_id(&self) -> u32 {
        self.ctx.thread_id
    }

    pub fn state(&self) -> SessionState {
        if self.shared.is_closed() && self.state != SessionState::Broken {
            SessionState::Closed
        } else {
            self.state
        }
    }

    /// Closed, aborted or broken.
    pub fn is_closed(&self) -> bool {
        !matches!(self.state(), SessionState::Ready | SessionState::Handshaking)
    }

    pub fn in_transaction(&self) -> bool {
        self.ctx.in_transaction()
    }

    pub fn prepare_cache(&self) -> &PrepareCache {
        &self.cache
    }

    /// A handle that can abort this session from another thread.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    // ---- command pipeline ----

    /// Fail fast on a dead session, drain a leaked stream and send pending
    /// statement closes.
    fn ensure_ready(&mut self) -> Result<()> {
        if self.is_closed() {
            return Err(closed_error());
        }
        if self.streaming {
            let res = self.drain_stream();
            self.check(res)?;
        }
        let ids = self.close_queue.drain();
        for id in ids {
            tracing::debug!(statement_id = id, "COM_STMT_CLOSE");
            let res = self.framer.write_command(&encode::encode_stmt_close(id));
            self.check(res)?;
        }
        Ok(())
    }

    /// Tear the stream down after a failure that desynchronized it.
    ///
    /// A failure caused by a concurrent abort is reported as
    /// [`Error::Cancelled`] and leaves the session closed rather than
    /// broken.
    fn check<T>(&mut self, res: Result<T>) -> Result<T> {
        let Err(e) = res else {
            return res;
        };
        if !e.requires_reconnect() || matches!(self.state, SessionState::Broken | SessionState::Closed) {
            return Err(e);
        }
        self.streaming = false;
        self.lookahead = None;
        self.cache.abandon();
        self.close_queue.drain();
        if self.shared.mark_closed() {
            tracing::warn!(host = %self.host, thread_id = self.ctx.thread_id, error = %e, "session broken");
            self.state = SessionState::Broken;
            self.shared.shutdown();
            Err(e)
        } else {
            tracing::debug!(thread_id = self.ctx.thread_id, error = %e, "command interrupted by abort");
            self.state = SessionState::Closed;
            Err(Error::Cancelled)
        }
    }

    fn send(&mut self, message: &ClientMessage) -> Result<()> {
        tracing::trace!(command = message.name(), "send");
        if let ClientMessage::Execute {
            statement_id,
            params,
            ..
        } = message
        {
            self.send_long_data(*statement_id, params)?;
        }
        self.framer.write_command(&message.encode())
    }

    fn send_long_data(&mut self, statement_id: u32, params: &[Value]) -> Result<()> {
        let chunk = self.config.max_packet_size.min(MAX_PACKET_SIZE) - 16;
        for (index, param) in params.iter().enumerate() {
            if !is_long_data(param) {
                continue;
            }
            let bytes = long_data_bytes(param);
            tracing::debug!(statement_id, param = index, len = bytes.len(), "streaming long data");
            for part in bytes.chunks(chunk) {
                self.framer
                    .write_command(&encode::encode_long_data(statement_id, index as u16, part))?;
            }
        }
        Ok(())
    }

    /// Send one command and read its response up to the first row.
    ///
    /// The query timeout, if any, covers this whole exchange, including
    /// materialized rows.
    pub(crate) fn start(
        &mut self,
        message: &ClientMessage,
        options: QueryOptions,
        cached: Option<Columns>,
        local: Option<&mut dyn Read>,
    ) -> Result<Pending> {
        self.ensure_ready()?;
        let timer = self
            .config
            .query_timeout
            .and_then(|t| QueryTimer::start(self.shared.target.clone(), t));
        self.shared.set_busy(true);
        let res = self.exchange(message, options, cached, local);
        self.shared.set_busy(false);
        if let (Err(e), Some(timer)) = (&res, &timer) {
            if timer.fired() {
                tracing::warn!(error = %e, "command failed after query timeout");
            }
        }
        drop(timer);
        self.check(res)
    }

    fn exchange(
        &mut self,
        message: &ClientMessage,
        options: QueryOptions,
        cached: Option<Columns>,
        local: Option<&mut dyn Read>,
    ) -> Result<Pending> {
        self.send(message)?;
        match message.expected_response() {
            ExpectedResponse::Nothing => Ok(Pending::Update(UpdateCount::default())),
            ExpectedResponse::PrepareOk => {
                let sql = message.sql().unwrap_or_default();
                let handle = self.read_prepare_response(sql)?;
                self.cache.put(Arc::new(handle)).release();
                Ok(Pending::Update(UpdateCount::default()))
            }
            ExpectedResponse::Ok | ExpectedResponse::Results => {
                let encoding = if matches!(message, ClientMessage::Execute { .. }) {
                    Encoding::Binary
                } else {
                    Encoding::Text
                };
                self.read_pending(message.sql(), encoding, options, cached, local)
            }
        }
    }

    fn read_pending(
        &mut self,
        sql: Option<&str>,
        encoding: Encoding,
        options: QueryOptions,
        cached: Option<Columns>,
        local: Option<&mut dyn Read>,
    ) -> Result<Pending> {
        match self.read_head(sql, cached, local)? {
            Head::Ok(ok) => {
                if ok.status_flags & SERVER_MORE_RESULTS_EXISTS != 0 {
                    self.skip_results(sql)?;
                }
                Ok(Pending::Update(UpdateCount {
                    affected_rows: ok.affected_rows,
                    last_insert_id: ok.last_insert_id,
                    warnings: ok.warnings,
                    info: ok.info,
                }))
            }
            Head::Rows(columns) => {
                let fetch_size = options.fetch_size.unwrap_or(self.config.fetch_size);
                let rows = if fetch_size == 0 {
                    let (rows, status) = self.read_all_rows(sql)?;
                    if status & SERVER_MORE_RESULTS_EXISTS != 0 {
                        self.skip_results(sql)?;
                    }
                    Some(rows)
                } else {
                    self.streaming = true;
                    None
                };
                Ok(Pending::Rows {
                    columns,
                    encoding,
                    cursor_type: options.cursor_type,
                    fetch_size,
                    rows,
                })
            }
        }
    }

    /// Dispatch on the first response byte.
    fn read_head(
        &mut self,
        sql: Option<&str>,
        cached: Option<Columns>,
        mut local: Option<&mut dyn Read>,
    ) -> Result<Head> {
        let mut local_failure = None;
        loop {
            let payload = self.framer.read_payload()?;
            match payload.first().copied() {
                Some(0x00) => {
                    let ok = PacketReader::new(&payload)
                        .parse_ok_packet(self.ctx.capabilities)
                        .ok_or_else(|| Error::malformed("truncated OK packet"))?;
                    self.ctx.apply_ok(&ok);
                    return match local_failure {
                        Some(e) => Err(e),
                        None => Ok(Head::Ok(ok)),
                    };
                }
                Some(0xFF) => {
                    let err = PacketReader::new(&payload)
                        .parse_err_packet()
                        .ok_or_else(|| Error::malformed("truncated error packet"))?;
                    return Err(local_failure.unwrap_or_else(|| err.into_error(sql)));
                }
                Some(0xFB) => {
                    let name = String::from_utf8_lossy(&payload[1..]).into_owned();
                    local_failure = self.send_local_file(&name, local.take())?;
                }
                Some(_) => {
                    let mut reader = PacketReader::new(&payload);
                    let count = reader
                        .read_lenenc_int()
                        .ok_or_else(|| Error::malformed("truncated result header"))?;
                    let metadata_follows = if self.ctx.has_capability(capabilities::CACHE_METADATA) {
                        reader.read_u8().unwrap_or(1) != 0
                    } else {
                        true
                    };
                    let columns = self.read_columns(count as usize, metadata_follows, cached)?;
                    return Ok(Head::Rows(columns));
                }
                None => return Err(Error::malformed("empty response packet")),
            }
        }
    }

    fn read_columns(&mut self, count: usize, metadata_follows: bool, cached: Option<Columns>) -> Result<Columns> {
        if !metadata_follows {
            return match cached {
                Some(columns) if columns.len() == count => {
                    tracing::trace!(count, "reusing cached column metadata");
                    Ok(columns)
                }
                _ => Err(Error::protocol(
                    ProtocolErrorKind::UnexpectedPacket,
                    "server skipped column metadata that is not cached",
                )),
            };
        }
        Ok(self.read_definitions(count)?.into())
    }

    /// Read `count` column definitions and, without DEPRECATE_EOF, the
    /// EOF that closes them.
    fn read_definitions(&mut self, count: usize) -> Result<Vec<ColumnDescriptor>> {
        let mut columns = Vec::with_capacity(count);
        if count == 0 {
            return Ok(columns);
        }
        for _ in 0..count {
            let payload = self.framer.read_payload()?;
            columns.push(ColumnDescriptor::parse(&payload, self.ctx.capabilities)?);
        }
        if !self.ctx.deprecate_eof() {
            let payload = self.framer.read_payload()?;
            if payload.first() != Some(&0xFE) {
                return Err(Error::protocol(
                    ProtocolErrorKind::UnexpectedPacket,
                    "expected EOF after column definitions",
                ));
            }
        }
        Ok(columns)
    }

    fn read_row(&mut self, sql: Option<&str>) -> Result<RowPacket> {
        let payload = self.framer.read_payload()?;
        let terminator_limit = if self.ctx.deprecate_eof() { MAX_PACKET_SIZE } else { 9 };
        match payload.first() {
            Some(0xFF) => {
                let err = PacketReader::new(&payload)
                    .parse_err_packet()
                    .ok_or_else(|| Error::malformed("truncated error packet"))?;
                Err(err.into_error(sql))
            }
            Some(0xFE) if payload.len() < terminator_limit => {
                let mut reader = PacketReader::new(&payload);
                let status = if self.ctx.deprecate_eof() {
                    let ok = reader
                        .parse_ok_packet(self.ctx.capabilities)
                        .ok_or_else(|| Error::malformed("truncated result terminator"))?;
                    self.ctx.apply_ok(&ok);
                    ok.status_flags
                } else {
                    let eof = reader
                        .parse_eof_packet()
                        .ok_or_else(|| Error::malformed("truncated EOF packet"))?;
                    self.ctx.apply_status(eof.status_flags, eof.warnings);
                    eof.status_flags
                };
                Ok(RowPacket::End {
                    status_flags: status,
                })
            }
            _ => Ok(RowPacket::Row(payload)),
        }
    }

    fn read_all_rows(&mut self, sql: Option<&str>) -> Result<(Vec<Vec<u8>>, u16)> {
        let mut rows = Vec::new();
        loop {
            match self.read_row(sql)? {
                RowPacket::Row(row) => rows.push(row),
                RowPacket::End { status_flags } => {
                    tracing::trace!(rows = rows.len(), "result read");
                    return Ok((rows, status_flags));
                }
            }
        }
    }

    /// Read and drop every further result of a multi-result response.
    fn skip_results(&mut self, sql: Option<&str>) -> Result<()> {
        let mut skipped = 0usize;
        loop {
            skipped += 1;
            let status = match self.read_head(sql, None, None)? {
                Head::Ok(ok) => ok.status_flags,
                Head::Rows(_) => self.read_all_rows(sql)?.1,
            };
            if status & SERVER_MORE_RESULTS_EXISTS == 0 {
                tracing::warn!(skipped, "discarded additional result sets");
                return Ok(());
            }
        }
    }

    /// Stream a LOAD DATA LOCAL source. Returns the local failure to report
    /// once the server has answered, if the source could not be read.
    fn send_local_file(&mut self, name: &str, source: Option<&mut dyn Read>) -> Result<Option<Error>> {
        let failure = match source {
            Some(reader) => self.stream_local(reader)?,
            None if self.config.local_infile => match File::open(name) {
                Ok(mut file) => self.stream_local(&mut file)?,
                Err(e) => Some(Error::Custom(format!("cannot open local file '{}': {}", name, e))),
            },
            None => Some(Error::Custom(format!(
                "server requested local file '{}' but local_infile is disabled",
                name
            ))),
        };
        if failure.is_some() {
            tracing::warn!(file = %name, "LOAD DATA LOCAL source unavailable");
        }
        self.framer.write_payload(&[])?;
        Ok(failure)
    }

    fn stream_local(&mut self, reader: &mut dyn Read) -> Result<Option<Error>> {
        let mut buf = vec![0u8; LOCAL_INFILE_CHUNK.min(self.config.max_packet_size)];
        let mut total = 0usize;
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Ok(Some(Error::Custom(format!("reading LOAD DATA source failed: {}", e)))),
            };
            self.framer.write_payload(&buf[..n])?;
            total += n;
        }
        tracing::debug!(bytes = total, "sent LOAD DATA LOCAL content");
        Ok(None)
    }

    /// Wrap a pending outcome into a result, borrowing the session for a
    /// streamed one.
    pub(crate) fn finish(&mut self, pending: Pending) -> Result<QueryResult<'_>> {
        match pending {
            Pending::Update(update) => Ok(QueryResult::Update(update)),
            Pending::Rows {
                columns,
                encoding,
                cursor_type,
                rows: Some(rows),
                ..
            } => Ok(QueryResult::Rows(ResultSet::materialized(
                columns,
                encoding,
                cursor_type,
                rows,
            )?)),
            Pending::Rows {
                columns,
                encoding,
                cursor_type,
                fetch_size,
                rows: None,
            } => {
                let fetcher = Box::new(SessionFetcher { session: self });
                Ok(QueryResult::Rows(ResultSet::streaming(
                    columns,
                    encoding,
                    cursor_type,
                    fetch_size,
                    fetcher,
                )?))
            }
        }
    }

    /// Materialize a pending outcome without borrowing the session.
    fn finish_owned(pending: Pending) -> Result<QueryResult<'static>> {
        match pending {
            Pending::Update(update) => Ok(QueryResult::Update(update)),
            Pending::Rows {
                columns,
                encoding,
                cursor_type,
                rows,
                ..
            } => Ok(QueryResult::Rows(ResultSet::materialized(
                columns,
                encoding,
                cursor_type,
                rows.unwrap_or_default(),
            )?)),
        }
    }

    fn fetch_rows(&mut self, max: usize) -> Result<FetchBatch> {
        if !self.streaming {
            return Ok(FetchBatch {
                rows: Vec::new(),
                done: true,
            });
        }
        let mut rows = Vec::with_capacity(max.min(MAX_FETCH_BATCH));
        rows.extend(self.lookahead.take());
        // A full batch still reads one packet, so the terminator of a result
        // that ends on a batch boundary is seen without another round-trip.
        let res = loop {
            match self.read_row(None) {
                Ok(RowPacket::Row(row)) if rows.len() >= max => {
                    self.lookahead = Some(row);
                    break Ok(false);
                }
                Ok(RowPacket::Row(row)) => rows.push(row),
                Ok(RowPacket::End { status_flags }) => {
                    self.streaming = false;
                    if status_flags & SERVER_MORE_RESULTS_EXISTS != 0 {
                        if let Err(e) = self.skip_results(None) {
                            break Err(e);
                        }
                    }
                    break Ok(true);
                }
                Err(e) => {
                    self.streaming = false;
                    break Err(e);
                }
            }
        };
        let done = self.check(res)?;
        tracing::trace!(rows = rows.len(), done, "fetched batch");
        Ok(FetchBatch { rows, done })
    }

    fn drain_stream(&mut self) -> Result<()> {
        let mut drained = 0usize;
        while self.streaming {
            drained += self.fetch_rows(MAX_FETCH_BATCH)?.rows.len();
        }
        tracing::debug!(rows = drained, "drained unread rows");
        Ok(())
    }

    // ---- public commands ----

    /// Run a text query with the configured fetch size.
    pub fn query(&mut self, sql: &str) -> Result<QueryResult<'_>> {
        self.query_with(sql, QueryOptions::default())
    }

    pub fn query_with(&mut self, sql: &str, options: QueryOptions) -> Result<QueryResult<'_>> {
        let pending = self.start_query(sql, options)?;
        self.finish(pending)
    }

    pub(crate) fn start_query(&mut self, sql: &str, options: QueryOptions) -> Result<Pending> {
        self.start(&ClientMessage::Query(sql.to_string()), options, None, None)
    }

    /// Run a statement and return every result it produces, materialized.
    pub fn query_all(&mut self, sql: &str) -> Result<Vec<QueryResult<'static>>> {
        self.ensure_ready()?;
        let res = self.read_all_results(sql);
        self.check(res)
    }

    fn read_all_results(&mut self, sql: &str) -> Result<Vec<QueryResult<'static>>> {
        self.framer
            .write_command(&ClientMessage::Query(sql.to_string()).encode())?;
        let mut results = Vec::new();
        loop {
            let (pending, status) = match self.read_head(Some(sql), None, None)? {
                Head::Ok(ok) => {
                    let status = ok.status_flags;
                    let update = UpdateCount {
                        affected_rows: ok.affected_rows,
                        last_insert_id: ok.last_insert_id,
                        warnings: ok.warnings,
                        info: ok.info,
                    };
                    (Pending::Update(update), status)
                }
                Head::Rows(columns) => {
                    let (rows, status) = self.read_all_rows(Some(sql))?;
                    let pending = Pending::Rows {
                        columns,
                        encoding: Encoding::Text,
                        cursor_type: CursorType::Scrollable,
                        fetch_size: 0,
                        rows: Some(rows),
                    };
                    (pending, status)
                }
            };
            results.push(Self::finish_owned(pending)?);
            if status & SERVER_MORE_RESULTS_EXISTS == 0 {
                return Ok(results);
            }
        }
    }

    /// Run a statement and drop any rows.
    pub(crate) fn execute_simple(&mut self, sql: &str) -> Result<()> {
        self.start_query(sql, QueryOptions::materialized()).map(|_| ())
    }

    fn run_ok(&mut self, message: &ClientMessage) -> Result<UpdateCount> {
        match self.start(message, QueryOptions::materialized(), None, None)? {
            Pending::Update(update) => Ok(update),
            Pending::Rows { .. } => Err(Error::protocol(
                ProtocolErrorKind::UnexpectedPacket,
                format!("{} returned rows", message.name()),
            )),
        }
    }

    /// Prepare `sql` on the server, or reuse the cached statement.
    ///
    /// The caller holds one use of the handle and must
    /// [`release`](PreparedHandle::release) it when done.
    pub fn prepare(&mut self, sql: &str) -> Result<Arc<PreparedHandle>> {
        if let Some(handle) = self.cache.get(sql) {
            return Ok(handle);
        }
        self.ensure_ready()?;
        tracing::debug!(sql, "prepare cache miss");
        let res = self
            .framer
            .write_command(&ClientMessage::Prepare(sql.to_string()).encode())
            .and_then(|()| self.read_prepare_response(sql));
        let handle = self.check(res)?;
        Ok(self.cache.put(Arc::new(handle)))
    }

    fn read_prepare_response(&mut self, sql: &str) -> Result<PreparedHandle> {
        let payload = self.framer.read_payload()?;
        if payload.first() == Some(&0xFF) {
            let err = PacketReader::new(&payload)
                .parse_err_packet()
                .ok_or_else(|| Error::malformed("truncated error packet"))?;
            return Err(err.into_error(Some(sql)));
        }
        let ok = encode::parse_prepare_ok(&payload)?;
        let params = self.read_definitions(usize::from(ok.num_params))?;
        let columns = self.read_definitions(usize::from(ok.num_columns))?;
        tracing::debug!(statement_id = ok.statement_id, params = ok.num_params, "prepared");
        Ok(PreparedHandle::new(
            ok.statement_id,
            sql,
            params,
            columns,
            self.close_queue.clone(),
        ))
    }

    /// Execute a parameterized statement.
    ///
    /// Uses the binary protocol through the prepare cache, or client-side
    /// interpolation when `use_server_prepare` is off.
    pub fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult<'_>> {
        self.execute_with(sql, params, QueryOptions::default())
    }

    pub fn execute_with(&mut self, sql: &str, params: &[Value], options: QueryOptions) -> Result<QueryResult<'_>> {
        let pending = self.start_execute(sql, params, options)?;
        self.finish(pending)
    }

    pub(crate) fn start_execute(&mut self, sql: &str, params: &[Value], options: QueryOptions) -> Result<Pending> {
        if !self.config.use_server_prepare {
            let text = encode::interpolate_params(sql, params)?;
            return self
                .start_query(&text, options)
                .map_err(|e| e.with_sql(sql));
        }
        let handle = self.prepare(sql)?;
        let res = self.start_prepared(&handle, params, options);
        handle.release();
        res
    }

    /// Execute an already prepared statement.
    pub fn execute_prepared(
        &mut self,
        handle: &PreparedHandle,
        params: &[Value],
        options: QueryOptions,
    ) -> Result<QueryResult<'_>> {
        let pending = self.start_prepared(handle, params, options)?;
        self.finish(pending)
    }

    fn start_prepared(&mut self, handle: &PreparedHandle, params: &[Value], options: QueryOptions) -> Result<Pending> {
        if params.len() != handle.num_params() {
            return Err(Error::Custom(format!(
                "statement expects {} parameters, {} supplied",
                handle.num_params(),
                params.len()
            )));
        }
        if handle.is_closed() {
            return Err(Error::Custom(format!(
                "prepared statement {} is closed",
                handle.statement_id
            )));
        }
        let message = ClientMessage::Execute {
            statement_id: handle.statement_id,
            sql: handle.sql.clone(),
            params: params.to_vec(),
        };
        let res = self.start(&message, options, Some(handle.columns.clone()), None);
        if let Err(e) = &res {
            if e.server_code() == Some(ER_UNKNOWN_STMT_HANDLER) {
                tracing::debug!(statement_id = handle.statement_id, "server forgot statement");
                self.cache.invalidate(&handle.sql);
            }
        }
        res
    }

    /// `LOAD DATA LOCAL INFILE` fed from `source` instead of the file
    /// system.
    pub fn load_data(&mut self, sql: &str, source: &mut dyn Read) -> Result<UpdateCount> {
        match self.start(
            &ClientMessage::Query(sql.to_string()),
            QueryOptions::materialized(),
            None,
            Some(source),
        )? {
            Pending::Update(update) => Ok(update),
            Pending::Rows { .. } => Ok(UpdateCount::default()),
        }
    }

    /// Send every command, then read every response in order.
    ///
    /// Results are materialized. When a transport or protocol failure
    /// interrupts the batch, each response that could not be read is
    /// reported as a lost-response error. Falls back to one command at a
    /// time when pipelining is disabled or the stream is compressed.
    pub fn pipeline(&mut self, commands: &[ClientMessage]) -> Vec<Result<QueryResult<'static>>> {
        let mut results = Vec::with_capacity(commands.len());
        if let Err(e) = self.ensure_ready() {
            results.push(Err(e));
            results.extend(commands.iter().skip(1).map(|_| Err(lost_response())));
            results.truncate(commands.len());
            return results;
        }

        if !self.config.allow_pipelining || self.framer.is_compressed() {
            for command in commands {
                let res = self
                    .start(command, QueryOptions::materialized(), None, None)
                    .and_then(Self::finish_owned);
                let fatal = res.as_ref().is_err_and(|e| e.requires_reconnect());
                results.push(res);
                if fatal {
                    results.extend(commands[results.len()..].iter().map(|_| Err(lost_response())));
                    break;
                }
            }
            return results;
        }

        self.shared.set_busy(true);
        let mut sent = 0;
        let mut send_failure = None;
        for command in commands {
            match self.send(command) {
                Ok(()) => sent += 1,
                Err(e) => {
                    send_failure = Some(e);
                    break;
                }
            }
        }
        tracing::trace!(sent, total = commands.len(), "pipelined");

        let mut lost = false;
        for (index, command) in commands.iter().enumerate() {
            if index >= sent {
                results.push(Err(send_failure.take().unwrap_or_else(lost_response)));
                continue;
            }
            if lost {
                results.push(Err(lost_response()));
                continue;
            }
            let res = self.read_pipelined(command).and_then(Self::finish_owned);
            if res.as_ref().is_err_and(|e| e.requires_reconnect()) {
                lost = true;
            }
            results.push(res);
        }
        self.shared.set_busy(false);

        let fatal = results.iter().find_map(|r| match r {
            Err(e) if e.requires_reconnect() => Some(Error::connection(
                ConnectionErrorKind::Disconnected,
                e.to_string(),
            )),
            _ => None,
        });
        if let Some(e) = fatal {
            let _ = self.check::<()>(Err(e));
        }
        results
    }

    fn read_pipelined(&mut self, command: &ClientMessage) -> Result<Pending> {
        match command.expected_response() {
            ExpectedResponse::Nothing => Ok(Pending::Update(UpdateCount::default())),
            ExpectedResponse::PrepareOk => {
                self.framer.expect_reply();
                let handle = self.read_prepare_response(command.sql().unwrap_or_default())?;
                self.cache.put(Arc::new(handle)).release();
                Ok(Pending::Update(UpdateCount::default()))
            }
            ExpectedResponse::Ok | ExpectedResponse::Results => {
                self.framer.expect_reply();
                let encoding = if matches!(command, ClientMessage::Execute { .. }) {
                    Encoding::Binary
                } else {
                    Encoding::Text
                };
                self.read_pending(command.sql(), encoding, QueryOptions::materialized(), None, None)
            }
        }
    }

    /// Execute one prepared statement for each parameter set, pipelined.
    pub fn execute_batch(&mut self, sql: &str, param_sets: &[Vec<Value>]) -> Result<Vec<Result<UpdateCount>>> {
        let handle = self.prepare(sql)?;
        if let Some(bad) = param_sets.iter().find(|p| p.len() != handle.num_params()) {
            handle.release();
            return Err(Error::Custom(format!(
                "statement expects {} parameters, {} supplied",
                handle.num_params(),
                bad.len()
            )));
        }
        let commands: Vec<_> = param_sets
            .iter()
            .map(|params| ClientMessage::Execute {
                statement_id: handle.statement_id,
                sql: sql.to_string(),
                params: params.clone(),
            })
            .collect();
        let results = self
            .pipeline(&commands)
            .into_iter()
            .map(|r| {
                r.map(|result| match result {
                    QueryResult::Update(update) => update,
                    QueryResult::Rows(_) => UpdateCount::default(),
                })
            })
            .collect();
        handle.release();
        Ok(results)
    }

    pub fn ping(&mut self) -> Result<()> {
        self.run_ok(&ClientMessage::Ping).map(|_| ())
    }

    /// Reset server-side session state (`COM_RESET_CONNECTION`) and apply
    /// the configured settings again.
    pub fn reset(&mut self) -> Result<()> {
        self.run_ok(&ClientMessage::ResetConnection)?;
        self.cache.abandon();
        self.ctx.reset_changes();
        self.ctx.set_isolation(None);
        self.ctx.set_read_only(false);
        self.initialize()
    }

    // ---- session state ----

    pub fn set_database(&mut self, database: &str) -> Result<()> {
        self.run_ok(&ClientMessage::InitDb(database.to_string()))?;
        self.ctx.set_database(Some(database.to_string()));
        self.ctx.mark_changed(state_flags::DATABASE);
        Ok(())
    }

    pub fn set_autocommit(&mut self, autocommit: bool) -> Result<()> {
        self.execute_simple(if autocommit {
            "SET autocommit=1"
        } else {
            "SET autocommit=0"
        })?;
        self.ctx.mark_changed(state_flags::AUTOCOMMIT);
        Ok(())
    }

    pub fn set_transaction_isolation(&mut self, level: IsolationLevel) -> Result<()> {
        self.execute_simple(&format!(
            "SET SESSION TRANSACTION ISOLATION LEVEL {}",
            level.as_sql()
        ))?;
        self.ctx.set_isolation(Some(level));
        self.ctx.mark_changed(state_flags::TX_ISOLATION);
        Ok(())
    }

    pub fn set_read_only(&mut self, read_only: bool) -> Result<()> {
        self.execute_simple(if read_only {
            "SET SESSION TRANSACTION READ ONLY"
        } else {
            "SET SESSION TRANSACTION READ WRITE"
        })?;
        self.ctx.set_read_only(read_only);
        self.ctx.mark_changed(state_flags::READ_ONLY);
        Ok(())
    }

    /// Read/write timeout on the transport; `None` blocks indefinitely.
    pub fn set_network_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        if self.is_closed() {
            return Err(closed_error());
        }
        if let Some(socket) = self.shared.socket() {
            socket
                .set_read_timeout(timeout)
                .and_then(|()| socket.set_write_timeout(timeout))
                .map_err(|e| io_error("cannot set socket timeout", e))?;
        }
        self.ctx.set_network_timeout(timeout);
        self.ctx.mark_changed(state_flags::NETWORK_TIMEOUT);
        Ok(())
    }

    // ---- teardown ----

    /// Send COM_QUIT and close the transport. Only the first call has
    /// effect.
    pub fn close(&mut self) -> Result<()> {
        if !self.shared.mark_closed() {
            return Ok(());
        }
        self.streaming = false;
        self.lookahead = None;
        let res = if self.state == SessionState::Broken {
            Ok(())
        } else {
            self.framer.write_command(&ClientMessage::Quit.encode())
        };
        self.cache.abandon();
        self.close_queue.drain();
        self.shared.shutdown();
        if self.state != SessionState::Broken {
            self.state = SessionState::Closed;
        }
        tracing::debug!(host = %self.host, thread_id = self.ctx.thread_id, "session closed");
        res
    }

    /// Tear the session down without the quit exchange, killing any
    /// command in flight.
    pub fn abort(&mut self) {
        self.abort_handle().abort();
        self.streaming = false;
        self.lookahead = None;
        self.cache.abandon();
        self.close_queue.drain();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::debug!(error = %e, "close on drop");
        }
    }
}

fn lost_response() -> Error {
    Error::connection(
        ConnectionErrorKind::Disconnected,
        "response lost: an earlier pipelined command failed",
    )
}

/// Pulls rows of the current streamed result from the session.
struct SessionFetcher<'s> {
    session: &'s mut Session,
}

impl RowFetcher for SessionFetcher<'_> {
    fn fetch(&mut self, max: usize) -> Result<FetchBatch> {
        self.session.fetch_rows(max)
    }

    fn discard(&mut self) -> Result<()> {
        self.session.drain_stream()
    }
}

//! Scripted in-process server speaking enough of the protocol for the
//! integration tests: handshake (mysql_native_password, no TLS), text
//! queries, prepare/execute, ping, init-db, LOAD DATA LOCAL and quit.
//!
//! It understands a tiny SQL dialect over a single table `t(a, b)`:
//! `BEGIN`, `COMMIT`, `ROLLBACK`, `SET ...`, `KILL [QUERY] id`,
//! `INSERT INTO t VALUES (x, y)`, `SELECT * FROM t`, `SELECT 1`,
//! `SELECT SLEEP(n)` and `LOAD DATA LOCAL INFILE 'name' INTO TABLE t`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use s2wire::protocol::PacketWriter;
use s2wire::protocol::capabilities::*;
use s2wire::{Config, HostAddress};

const SERVER_CAPS: u64 = CLIENT_MYSQL
    | CLIENT_PROTOCOL_41
    | CLIENT_SECURE_CONNECTION
    | CLIENT_PLUGIN_AUTH
    | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
    | CLIENT_DEPRECATE_EOF
    | CLIENT_TRANSACTIONS
    | CLIENT_MULTI_STATEMENTS
    | CLIENT_MULTI_RESULTS
    | CLIENT_PS_MULTI_RESULTS
    | CLIENT_LOCAL_FILES;

const STATUS_IN_TRANS: u16 = 0x0001;
const STATUS_AUTOCOMMIT: u16 = 0x0002;

const TYPE_LONGLONG: u8 = 8;

#[derive(Default)]
struct State {
    rows: Mutex<Vec<(i64, i64)>>,
    log: Mutex<Vec<String>>,
    drop_on: Mutex<Option<String>>,
    /// Pending kills by thread id; `true` kills only the running statement.
    kills: Mutex<HashMap<u32, bool>>,
    connections: AtomicUsize,
    next_thread: AtomicU32,
    next_statement: AtomicU32,
}

/// A mock server listening on 127.0.0.1.
pub struct MockServer {
    port: u16,
    state: Arc<State>,
}

impl MockServer {
    pub fn start() -> Self {
        Self::start_with_statement_base(1)
    }

    /// Statement ids handed out by this server start at `base`.
    pub fn start_with_statement_base(base: u32) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let port = listener.local_addr().expect("local addr").port();
        let state = Arc::new(State {
            next_thread: AtomicU32::new(100),
            next_statement: AtomicU32::new(base),
            ..State::default()
        });
        let accept_state = Arc::clone(&state);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let state = Arc::clone(&accept_state);
                thread::spawn(move || {
                    let _ = Connection::new(stream, state).serve();
                });
            }
        });
        MockServer { port, state }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn host(&self) -> HostAddress {
        HostAddress::new("127.0.0.1", self.port)
    }

    pub fn config(&self) -> Config {
        Config::new()
            .host("127.0.0.1")
            .port(self.port)
            .user("app")
            .password("secret")
            .connect_timeout(Duration::from_secs(5))
    }

    /// Commands received so far, one line each.
    pub fn log(&self) -> Vec<String> {
        self.state.log.lock().unwrap().clone()
    }

    /// Log lines that are not connection setup noise.
    pub fn statements(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .filter(|l| !l.starts_with("SET ") && l != "PING")
            .collect()
    }

    pub fn rows(&self) -> Vec<(i64, i64)> {
        self.state.rows.lock().unwrap().clone()
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Drop the connection, without answering, the next time a command
    /// containing `fragment` arrives.
    pub fn drop_connection_on(&self, fragment: &str) {
        *self.state.drop_on.lock().unwrap() = Some(fragment.to_string());
    }
}

struct Statement {
    sql: String,
    params: usize,
}

struct Connection {
    stream: TcpStream,
    state: Arc<State>,
    thread_id: u32,
    seq: u8,
    in_trans: bool,
    snapshot: Option<Vec<(i64, i64)>>,
    statements: HashMap<u32, Statement>,
}

fn read_exact_or_eof(stream: &mut TcpStream, buf: &mut [u8]) -> io::Result<bool> {
    match stream.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn column_def(name: &str) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_lenenc_string("def");
    w.write_lenenc_string("test");
    w.write_lenenc_string("t");
    w.write_lenenc_string("t");
    w.write_lenenc_string(name);
    w.write_lenenc_string(name);
    w.write_lenenc_int(0x0c);
    w.write_u16_le(63);
    w.write_u32_le(20);
    w.write_u8(TYPE_LONGLONG);
    w.write_u16_le(0);
    w.write_u8(0);
    w.write_zeros(2);
    w.into_bytes()
}

fn parse_pair(sql: &str) -> Option<(i64, i64)> {
    let open = sql.find('(')?;
    let close = sql.rfind(')')?;
    let (a, b) = sql[open + 1..close].split_once(',')?;
    Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
}

impl Connection {
    fn new(stream: TcpStream, state: Arc<State>) -> Self {
        Connection {
            stream,
            state,
            thread_id: 0,
            seq: 0,
            in_trans: false,
            snapshot: None,
            statements: HashMap::new(),
        }
    }

    fn read_packet(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut header = [0u8; 4];
        if !read_exact_or_eof(&mut self.stream, &mut header)? {
            return Ok(None);
        }
        let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
        self.seq = header[3].wrapping_add(1);
        let mut payload = vec![0u8; len];
        if !read_exact_or_eof(&mut self.stream, &mut payload)? {
            return Ok(None);
        }
        Ok(Some(payload))
    }

    fn write_packet(&mut self, payload: &[u8]) -> io::Result<()> {
        let len = payload.len() as u32;
        let header = [len as u8, (len >> 8) as u8, (len >> 16) as u8, self.seq];
        self.seq = self.seq.wrapping_add(1);
        self.stream.write_all(&header)?;
        self.stream.write_all(payload)
    }

    fn status(&self) -> u16 {
        STATUS_AUTOCOMMIT | if self.in_trans { STATUS_IN_TRANS } else { 0 }
    }

    fn ok_body(&self, marker: u8, affected: u64) -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.write_u8(marker);
        w.write_lenenc_int(affected);
        w.write_lenenc_int(0);
        w.write_u16_le(self.status());
        w.write_u16_le(0);
        w.into_bytes()
    }

    fn send_ok(&mut self, affected: u64) -> io::Result<()> {
        let body = self.ok_body(0x00, affected);
        self.write_packet(&body)
    }

    fn send_err(&mut self, code: u16, state: &str, message: &str) -> io::Result<()> {
        let mut w = PacketWriter::new();
        w.write_u8(0xFF);
        w.write_u16_le(code);
        w.write_u8(b'#');
        w.write_bytes(state.as_bytes());
        w.write_bytes(message.as_bytes());
        self.write_packet(&w.into_bytes())
    }

    fn send_rows(&mut self, columns: &[&str], rows: &[Vec<i64>]) -> io::Result<()> {
        let mut w = PacketWriter::new();
        w.write_lenenc_int(columns.len() as u64);
        self.write_packet(&w.into_bytes())?;
        for name in columns {
            self.write_packet(&column_def(name))?;
        }
        for row in rows {
            let mut w = PacketWriter::new();
            for value in row {
                w.write_lenenc_string(&value.to_string());
            }
            self.write_packet(&w.into_bytes())?;
        }
        let end = self.ok_body(0xFE, 0);
        self.write_packet(&end)
    }

    fn handshake(&mut self) -> io::Result<bool> {
        let thread_id = self.state.next_thread.fetch_add(1, Ordering::SeqCst);
        self.thread_id = thread_id;
        let mut w = PacketWriter::new();
        w.write_u8(10);
        w.write_null_string("8.5.1-mock");
        w.write_u32_le(thread_id);
        w.write_bytes(b"abcdefgh");
        w.write_u8(0);
        w.write_u16_le(SERVER_CAPS as u16);
        w.write_u8(45);
        w.write_u16_le(STATUS_AUTOCOMMIT);
        w.write_u16_le((SERVER_CAPS >> 16) as u16);
        w.write_u8(21);
        w.write_zeros(6);
        w.write_u32_le((SERVER_CAPS >> 32) as u32);
        w.write_bytes(b"ijklmnopqrst");
        w.write_u8(0);
        w.write_null_string("mysql_native_password");
        self.seq = 0;
        self.write_packet(&w.into_bytes())?;

        if self.read_packet()?.is_none() {
            return Ok(false);
        }
        self.send_ok(0)?;
        self.state.connections.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    fn serve(mut self) -> io::Result<()> {
        if !self.handshake()? {
            return Ok(());
        }
        while let Some(packet) = self.read_packet()? {
            let Some((&command, body)) = packet.split_first() else {
                return Ok(());
            };
            let text = String::from_utf8_lossy(body).into_owned();
            let keep_going = match command {
                0x01 => false,
                0x02 => self.logged(format!("INIT_DB {}", text), |c| c.send_ok(0))?,
                0x03 => self.logged(text.clone(), |c| c.query(&text))?,
                0x0e => self.logged("PING".to_string(), |c| c.send_ok(0))?,
                0x16 => self.logged(format!("PREPARE {}", text), |c| c.prepare(&text))?,
                0x17 => self.execute(body)?,
                0x18 => true,
                0x19 => {
                    let id = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
                    self.statements.remove(&id);
                    self.state.log.lock().unwrap().push(format!("CLOSE {}", id));
                    true
                }
                0x1f => self.logged("RESET".to_string(), |c| c.send_ok(0))?,
                _ => {
                    self.send_err(1047, "08S01", "Unknown command")?;
                    true
                }
            };
            if !keep_going {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Record `line` and answer, unless the server was told to drop the
    /// connection on it.
    ///
    /// A dropped connection is half-closed and drained until the client
    /// hangs up, so responses already written are never lost to a reset.
    fn logged(&mut self, line: String, answer: impl FnOnce(&mut Self) -> io::Result<()>) -> io::Result<bool> {
        let drop_here = {
            let mut drop_on = self.state.drop_on.lock().unwrap();
            let hit = drop_on.as_ref().is_some_and(|f| line.contains(f.as_str()));
            if hit {
                *drop_on = None;
            }
            hit
        };
        if drop_here {
            let _ = self.stream.shutdown(Shutdown::Write);
            let _ = io::copy(&mut self.stream, &mut io::sink());
            return Ok(false);
        }
        self.state.log.lock().unwrap().push(line);
        answer(self)?;
        Ok(true)
    }

    fn query(&mut self, sql: &str) -> io::Result<()> {
        let upper = sql.trim().to_ascii_uppercase();
        if upper == "BEGIN" || upper.starts_with("START TRANSACTION") {
            self.in_trans = true;
            self.snapshot = Some(self.state.rows.lock().unwrap().clone());
            self.send_ok(0)
        } else if upper == "COMMIT" {
            self.in_trans = false;
            self.snapshot = None;
            self.send_ok(0)
        } else if upper == "ROLLBACK" {
            self.in_trans = false;
            if let Some(rows) = self.snapshot.take() {
                *self.state.rows.lock().unwrap() = rows;
            }
            self.send_ok(0)
        } else if upper.starts_with("SET ") {
            self.send_ok(0)
        } else if let Some(target) = upper.strip_prefix("KILL ") {
            let (query_only, id) = match target.trim().strip_prefix("QUERY ") {
                Some(id) => (true, id),
                None => (false, target),
            };
            match id.trim().parse::<u32>() {
                Ok(id) => {
                    self.state.kills.lock().unwrap().insert(id, query_only);
                    self.send_ok(0)
                }
                Err(_) => self.send_err(1094, "HY000", "Unknown thread id"),
            }
        } else if upper.starts_with("SELECT SLEEP(") {
            self.sleep(&upper)
        } else if upper.starts_with("INSERT INTO T VALUES") {
            match parse_pair(sql) {
                Some(pair) => {
                    self.state.rows.lock().unwrap().push(pair);
                    self.send_ok(1)
                }
                None => self.send_err(1136, "21S01", "Column count doesn't match value count"),
            }
        } else if upper == "SELECT * FROM T" {
            let rows: Vec<Vec<i64>> = self
                .state
                .rows
                .lock()
                .unwrap()
                .iter()
                .map(|&(a, b)| vec![a, b])
                .collect();
            self.send_rows(&["a", "b"], &rows)
        } else if upper == "SELECT 1" {
            self.send_rows(&["1"], &[vec![1]])
        } else if upper.starts_with("LOAD DATA LOCAL INFILE") {
            self.load_local(sql)
        } else {
            self.send_err(1064, "42000", "You have an error in your SQL syntax")
        }
    }

    /// Sleep until the deadline or until a `KILL` names this connection.
    fn sleep(&mut self, sql: &str) -> io::Result<()> {
        let secs = sql
            .split(['(', ')'])
            .nth(1)
            .and_then(|n| n.trim().parse::<f64>().ok())
            .unwrap_or(0.0);
        let deadline = Instant::now() + Duration::from_secs_f64(secs);
        loop {
            let killed = self.state.kills.lock().unwrap().remove(&self.thread_id);
            match killed {
                Some(true) => return self.send_err(1317, "70100", "Query execution was interrupted"),
                Some(false) => {
                    return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "connection killed"));
                }
                None if Instant::now() >= deadline => return self.send_rows(&["sleep"], &[vec![0]]),
                None => thread::sleep(Duration::from_millis(10)),
            }
        }
    }

    fn load_local(&mut self, sql: &str) -> io::Result<()> {
        let name = sql.split('\'').nth(1).unwrap_or("data.csv").to_string();
        let mut w = PacketWriter::new();
        w.write_u8(0xFB);
        w.write_bytes(name.as_bytes());
        self.write_packet(&w.into_bytes())?;

        let mut content = Vec::new();
        loop {
            match self.read_packet()? {
                Some(chunk) if chunk.is_empty() => break,
                Some(chunk) => content.extend_from_slice(&chunk),
                None => return Ok(()),
            }
        }
        let text = String::from_utf8_lossy(&content);
        let mut loaded = 0;
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            if let Some(pair) = parse_pair(&format!("({})", line)) {
                self.state.rows.lock().unwrap().push(pair);
                loaded += 1;
            }
        }
        self.send_ok(loaded)
    }

    fn prepare(&mut self, sql: &str) -> io::Result<()> {
        let params = sql.matches('?').count();
        let upper = sql.trim().to_ascii_uppercase();
        let columns: &[&str] = if upper == "SELECT * FROM T" { &["a", "b"] } else { &[] };
        if !(upper.starts_with("INSERT INTO T VALUES") || !columns.is_empty()) {
            return self.send_err(1064, "42000", "You have an error in your SQL syntax");
        }
        let id = self.state.next_statement.fetch_add(1, Ordering::SeqCst);
        self.statements.insert(
            id,
            Statement {
                sql: sql.to_string(),
                params,
            },
        );

        let mut w = PacketWriter::new();
        w.write_u8(0x00);
        w.write_u32_le(id);
        w.write_u16_le(columns.len() as u16);
        w.write_u16_le(params as u16);
        w.write_u8(0);
        w.write_u16_le(0);
        self.write_packet(&w.into_bytes())?;
        for i in 0..params {
            self.write_packet(&column_def(&format!("?{}", i)))?;
        }
        for name in columns {
            self.write_packet(&column_def(name))?;
        }
        Ok(())
    }

    fn execute(&mut self, body: &[u8]) -> io::Result<bool> {
        let id = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
        let Some(statement) = self.statements.get(&id) else {
            self.state.log.lock().unwrap().push(format!("EXECUTE unknown {}", id));
            self.send_err(1243, "HY000", "Unknown prepared statement handler")?;
            return Ok(true);
        };
        let values = decode_params(&body[9..], statement.params);
        let mut sql = String::new();
        let mut next = values.iter();
        for ch in statement.sql.chars() {
            if ch == '?' {
                sql.push_str(next.next().map_or("NULL", String::as_str));
            } else {
                sql.push(ch);
            }
        }
        self.logged(format!("EXECUTE {} {}", id, sql), |c| c.query(&sql))
    }
}

/// Decode binary parameters as SQL literals.
fn decode_params(data: &[u8], count: usize) -> Vec<String> {
    if count == 0 {
        return Vec::new();
    }
    let bitmap_len = count.div_ceil(8);
    let bitmap = &data[..bitmap_len];
    let mut pos = bitmap_len + 1;
    let types: Vec<u8> = (0..count).map(|i| data[pos + i * 2]).collect();
    pos += count * 2;

    let mut out = Vec::with_capacity(count);
    for (i, ty) in types.into_iter().enumerate() {
        if bitmap[i / 8] & (1 << (i % 8)) != 0 {
            out.push("NULL".to_string());
            continue;
        }
        let (text, width) = match ty {
            1 => ((data[pos] as i8).to_string(), 1),
            2 => (i16::from_le_bytes([data[pos], data[pos + 1]]).to_string(), 2),
            3 => (
                i32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()).to_string(),
                4,
            ),
            8 => (
                i64::from_le_bytes(data[pos..pos + 8].try_into().unwrap()).to_string(),
                8,
            ),
            _ => {
                let len = data[pos] as usize;
                let s = String::from_utf8_lossy(&data[pos + 1..pos + 1 + len]);
                (format!("'{}'", s), 1 + len)
            }
        };
        out.push(text);
        pos += width;
    }
    out
}

//! Typed outbound commands.
//!
//! Each message encodes its own payload and knows which response shape the
//! server answers with. Reading the response itself is the session's job;
//! it dispatches on the first payload byte (`0x00` OK, `0xFF` ERR, `0xFB`
//! local infile request, anything else a result-set header).

use s2wire_core::Value;

use crate::protocol::{Command, PacketWriter};
use crate::types::encode;

/// What a command's response looks like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedResponse {
    /// No response at all (COM_QUIT, COM_STMT_CLOSE, long data).
    Nothing,
    /// A single OK or ERR packet.
    Ok,
    /// OK, ERR, local infile request, or one or more result sets.
    Results,
    /// COM_STMT_PREPARE_OK followed by parameter and column definitions.
    PrepareOk,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Query(String),
    Prepare(String),
    Execute {
        statement_id: u32,
        /// Statement text, kept for error context and re-prepare on replay.
        sql: String,
        params: Vec<Value>,
    },
    LongData {
        statement_id: u32,
        param_index: u16,
        chunk: Vec<u8>,
    },
    StmtClose(u32),
    InitDb(String),
    Ping,
    ResetConnection,
    Quit,
}

impl ClientMessage {
    /// Encode the command payload (opcode first).
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ClientMessage::Query(sql) => with_text(Command::Query, sql),
            ClientMessage::Prepare(sql) => with_text(Command::StmtPrepare, sql),
            ClientMessage::InitDb(db) => with_text(Command::InitDb, db),
            ClientMessage::Execute {
                statement_id,
                params,
                ..
            } => encode::encode_execute(*statement_id, params),
            ClientMessage::LongData {
                statement_id,
                param_index,
                chunk,
            } => encode::encode_long_data(*statement_id, *param_index, chunk),
            ClientMessage::StmtClose(id) => encode::encode_stmt_close(*id),
            ClientMessage::Ping => PacketWriter::command(Command::Ping).into_bytes(),
            ClientMessage::ResetConnection => {
                PacketWriter::command(Command::ResetConnection).into_bytes()
            }
            ClientMessage::Quit => PacketWriter::command(Command::Quit).into_bytes(),
        }
    }

    pub fn expected_response(&self) -> ExpectedResponse {
        match self {
            ClientMessage::Query(_) | ClientMessage::Execute { .. } => ExpectedResponse::Results,
            ClientMessage::Prepare(_) => ExpectedResponse::PrepareOk,
            ClientMessage::InitDb(_) | ClientMessage::Ping | ClientMessage::ResetConnection => {
                ExpectedResponse::Ok
            }
            ClientMessage::LongData { .. } | ClientMessage::StmtClose(_) | ClientMessage::Quit => {
                ExpectedResponse::Nothing
            }
        }
    }

    /// SQL text carried by the command, for error context.
    pub fn sql(&self) -> Option<&str> {
        match self {
            ClientMessage::Query(sql)
            | ClientMessage::Prepare(sql)
            | ClientMessage::Execute { sql, .. } => Some(sql),
            _ => None,
        }
    }

    /// Can this command be recorded in a transaction replay log and sent
    /// again on a new session?
    pub fn is_redoable(&self) -> bool {
        matches!(
            self,
            ClientMessage::Query(_) | ClientMessage::Execute { .. } | ClientMessage::InitDb(_)
        )
    }

    /// Does this command end the transaction with a COMMIT?
    ///
    /// A COMMIT lost in transit has an unknown outcome and is never resent.
    pub fn is_commit(&self) -> bool {
        self.sql().is_some_and(|sql| starts_with_keyword(sql, "COMMIT"))
    }

    /// Does this command end the transaction with a ROLLBACK?
    pub fn is_rollback(&self) -> bool {
        self.sql().is_some_and(|sql| starts_with_keyword(sql, "ROLLBACK"))
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::Query(_) => "COM_QUERY",
            ClientMessage::Prepare(_) => "COM_STMT_PREPARE",
            ClientMessage::Execute { .. } => "COM_STMT_EXECUTE",
            ClientMessage::LongData { .. } => "COM_STMT_SEND_LONG_DATA",
            ClientMessage::StmtClose(_) => "COM_STMT_CLOSE",
            ClientMessage::InitDb(_) => "COM_INIT_DB",
            ClientMessage::Ping => "COM_PING",
            ClientMessage::ResetConnection => "COM_RESET_CONNECTION",
            ClientMessage::Quit => "COM_QUIT",
        }
    }
}

fn with_text(command: Command, text: &str) -> Vec<u8> {
    let mut w = PacketWriter::with_capacity(1 + text.len());
    w.write_u8(command as u8);
    w.write_bytes(text.as_bytes());
    w.into_bytes()
}

/// Case-insensitive keyword test that skips leading whitespace and
/// comments.
pub(crate) fn starts_with_keyword(sql: &str, keyword: &str) -> bool {
    let mut rest = sql.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map_or("", |(_, r)| r).trim_start();
        } else if rest.starts_with("--") || rest.starts_with('#') {
            rest = rest.split_once('\n').map_or("", |(_, r)| r).trim_start();
        } else {
            break;
        }
    }
    rest.len() >= keyword.len()
        && rest.as_bytes()[..keyword.len()].eq_ignore_ascii_case(keyword.as_bytes())
        && rest[keyword.len()..]
            .chars()
            .next()
            .is_none_or(|c| !c.is_ascii_alphanumeric() && c != '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_commands_encode_opcode_then_text() {
        assert_eq!(ClientMessage::Query("SELECT 1".into()).encode(), b"\x03SELECT 1");
        assert_eq!(ClientMessage::Prepare("SELECT ?".into()).encode(), b"\x16SELECT ?");
        assert_eq!(ClientMessage::InitDb("db".into()).encode(), b"\x02db");
        assert_eq!(ClientMessage::Ping.encode(), vec![0x0e]);
        assert_eq!(ClientMessage::Quit.encode(), vec![0x01]);
        assert_eq!(ClientMessage::StmtClose(9).encode(), vec![0x19, 9, 0, 0, 0]);
    }

    #[test]
    fn expected_responses() {
        assert_eq!(
            ClientMessage::Query(String::new()).expected_response(),
            ExpectedResponse::Results
        );
        assert_eq!(
            ClientMessage::StmtClose(1).expected_response(),
            ExpectedResponse::Nothing
        );
        assert_eq!(ClientMessage::Ping.expected_response(), ExpectedResponse::Ok);
        assert_eq!(
            ClientMessage::Prepare(String::new()).expected_response(),
            ExpectedResponse::PrepareOk
        );
    }

    #[test]
    fn commit_detection() {
        assert!(ClientMessage::Query("commit".into()).is_commit());
        assert!(ClientMessage::Query("  /* tx */ COMMIT WORK".into()).is_commit());
        assert!(ClientMessage::Query("-- end\nCOMMIT;".into()).is_commit());
        assert!(!ClientMessage::Query("SELECT 'COMMIT'".into()).is_commit());
        assert!(!ClientMessage::Query("COMMITTED".into()).is_commit());
        assert!(ClientMessage::Query("rollback".into()).is_rollback());
        assert!(!ClientMessage::Ping.is_commit());
    }

    #[test]
    fn redoable_commands() {
        assert!(ClientMessage::Query("INSERT".into()).is_redoable());
        assert!(
            ClientMessage::Execute {
                statement_id: 1,
                sql: "INSERT".into(),
                params: vec![],
            }
            .is_redoable()
        );
        assert!(!ClientMessage::Ping.is_redoable());
        assert!(!ClientMessage::Prepare("SELECT 1".into()).is_redoable());
    }
}

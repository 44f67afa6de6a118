//! Commands of the open transaction, kept for replay on a new host.

use crate::protocol::ClientMessage;

/// Bounded log of redoable commands issued since the transaction began.
///
/// Overflowing the capacity marks the log dirty: the transaction can no
/// longer be replayed, and the buffered commands are released.
#[derive(Debug, Clone)]
pub struct TransactionReplayLog {
    entries: Vec<ClientMessage>,
    capacity: usize,
    dirty: bool,
}

impl TransactionReplayLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
            dirty: false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn entries(&self) -> &[ClientMessage] {
        &self.entries
    }

    /// Append a command that completed inside the transaction.
    pub fn record(&mut self, message: &ClientMessage) {
        if self.dirty || !message.is_redoable() {
            return;
        }
        if self.entries.len() >= self.capacity {
            tracing::debug!(capacity = self.capacity, "replay log overflow");
            self.invalidate();
            return;
        }
        self.entries.push(message.clone());
    }

    /// Give up on replaying the current transaction.
    pub fn invalidate(&mut self) {
        self.dirty = true;
        self.entries = Vec::new();
    }

    /// Forget everything; the transaction ended.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use s2wire_core::Value;

    #[test]
    fn records_redoable_commands_in_order() {
        let mut log = TransactionReplayLog::new(8);
        log.record(&ClientMessage::Query("BEGIN".into()));
        log.record(&ClientMessage::Ping);
        log.record(&ClientMessage::Execute {
            statement_id: 4,
            sql: "INSERT INTO t VALUES (?)".into(),
            params: vec![Value::Int(1)],
        });
        assert_eq!(log.len(), 2);
        assert_eq!(log.entries()[0].sql(), Some("BEGIN"));
        assert_eq!(log.entries()[1].name(), "COM_STMT_EXECUTE");
        assert!(!log.is_dirty());
    }

    #[test]
    fn overflow_marks_dirty_until_cleared() {
        let mut log = TransactionReplayLog::new(2);
        for i in 0..3 {
            log.record(&ClientMessage::Query(format!("INSERT INTO t VALUES ({})", i)));
        }
        assert!(log.is_dirty());
        assert!(log.is_empty());
        log.record(&ClientMessage::Query("SELECT 1".into()));
        assert!(log.is_empty());

        log.clear();
        assert!(!log.is_dirty());
        log.record(&ClientMessage::Query("SELECT 1".into()));
        assert_eq!(log.len(), 1);
        log.clear();
        assert!(log.is_empty());
    }
}

//! Append-only turn log sink.
//!
//! The durable store behind this contract (SQL, object storage) lives
//! outside the core; the default implementation writes structured tracing
//! events that a collector can ship wherever it likes.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One appended transcript row.
#[derive(Debug, Clone, Serialize)]
pub struct TurnLogRecord {
    pub ts: DateTime<Utc>,
    /// Filled by the auth layer when one is deployed in front.
    pub user_id: Option<String>,
    pub conversation_id: String,
    pub role: String,
    pub tool_name: Option<String>,
    pub tokens: u32,
    pub model: String,
}

impl TurnLogRecord {
    pub fn new(
        conversation_id: impl Into<String>,
        role: impl Into<String>,
        model: impl Into<String>,
        tokens: u32,
    ) -> Self {
        Self {
            ts: Utc::now(),
            user_id: None,
            conversation_id: conversation_id.into(),
            role: role.into(),
            tool_name: None,
            tokens,
            model: model.into(),
        }
    }

    pub fn with_tool(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self
    }
}

/// Append-only sink consumed by the orchestrator.
pub trait LogSink: Send + Sync {
    fn append(&self, record: TurnLogRecord);
}

/// Default sink: one structured tracing event per row, under the
/// `turn_log` target.
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn append(&self, record: TurnLogRecord) {
        tracing::info!(
            target: "turn_log",
            ts = %record.ts.to_rfc3339(),
            user_id = record.user_id.as_deref().unwrap_or("-"),
            conversation_id = %record.conversation_id,
            role = %record.role,
            tool_name = record.tool_name.as_deref().unwrap_or("-"),
            tokens = record.tokens,
            model = %record.model,
            "turn log"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct VecSink {
        rows: Mutex<Vec<TurnLogRecord>>,
    }

    impl LogSink for VecSink {
        fn append(&self, record: TurnLogRecord) {
            self.rows.lock().push(record);
        }
    }

    #[test]
    fn records_append_in_order() {
        let sink = VecSink::default();
        sink.append(TurnLogRecord::new("c1", "user", "analyst", 12));
        sink.append(
            TurnLogRecord::new("c1", "tool", "analyst", 80).with_tool("get_stock_quote"),
        );

        let rows = sink.rows.lock();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].role, "user");
        assert_eq!(rows[1].tool_name.as_deref(), Some("get_stock_quote"));
        assert!(rows[0].user_id.is_none());
    }
}

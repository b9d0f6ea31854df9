//! Database driver seam.
//!
//! The pool and both managers talk to the database only through these
//! traits. [`crate::surreal`] provides the WebSocket RPC implementation.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::{ExporterError, Result};

/// Result of one statement within a `query` call.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StatementResult {
    pub status: String,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub time: Option<String>,
}

impl StatementResult {
    pub fn ok(result: Value) -> Self {
        Self {
            status: "OK".to_string(),
            result,
            time: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            status: "ERR".to_string(),
            result: Value::String(message.into()),
            time: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status.eq_ignore_ascii_case("OK")
    }

    /// Convert an `ERR` status into [`ExporterError::Query`].
    pub fn into_result(self, statement: &str) -> Result<Value> {
        if self.is_ok() {
            return Ok(self.result);
        }
        let message = match self.result {
            Value::String(s) => s,
            other => other.to_string(),
        };
        Err(ExporterError::Query {
            statement: statement.to_string(),
            message,
        })
    }
}

/// One change event delivered on a live query.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub live_id: String,
    pub action: String,
    pub result: Option<Value>,
    pub before: Option<Value>,
}

impl Notification {
    /// Record to classify: the result when it is an object, otherwise the before-image.
    pub fn record(&self) -> Option<&Value> {
        match (&self.result, &self.before) {
            (Some(result @ Value::Object(_)), _) => Some(result),
            (_, Some(before @ Value::Object(_))) => Some(before),
            (result, _) => result.as_ref(),
        }
    }
}

/// An open live query and its notification stream.
///
/// The stream ends when the server kills the query or the connection drops.
#[derive(Debug)]
pub struct LiveStream {
    pub id: String,
    notifications: mpsc::UnboundedReceiver<Notification>,
}

impl LiveStream {
    pub fn new(id: impl Into<String>, notifications: mpsc::UnboundedReceiver<Notification>) -> Self {
        Self {
            id: id.into(),
            notifications,
        }
    }

    pub async fn next(&mut self) -> Option<Notification> {
        self.notifications.recv().await
    }
}

/// An authenticated connection.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Switch the namespace/database subsequent statements run in.
    async fn use_scope(&self, namespace: &str, database: &str) -> Result<()>;

    /// Run SurrealQL and return one result per statement.
    async fn query(&self, statement: &str) -> Result<Vec<StatementResult>>;

    /// Start a live query on `table` in the current scope.
    async fn live(&self, table: &str) -> Result<LiveStream>;

    async fn kill(&self, live_id: &str) -> Result<()>;

    /// Server version, e.g. `2.1.4`.
    async fn version(&self) -> Result<String>;

    /// True once the underlying connection is gone for good.
    fn is_closed(&self) -> bool;
}

/// Opens and authenticates new sessions.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Arc<dyn Session>>;
}

/// Run a single statement and return its payload.
pub async fn query_one(session: &dyn Session, statement: &str) -> Result<Value> {
    let mut results = session.query(statement).await?;
    if results.is_empty() {
        return Err(ExporterError::Protocol(format!(
            "no statement result returned for: {}",
            statement
        )));
    }
    results.swap_remove(0).into_result(statement)
}

/// Quote a SurrealQL identifier unless it is a plain word.
pub fn escape_ident(name: &str) -> String {
    let plain = !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if plain {
        name.to_string()
    } else {
        format!("`{}`", name.replace('`', "\\`"))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_statement_result_error_carries_statement() {
        let err = StatementResult::err("table not found")
            .into_result("SELECT * FROM x")
            .unwrap_err();
        match err {
            ExporterError::Query { statement, message } => {
                assert_eq!(statement, "SELECT * FROM x");
                assert_eq!(message, "table not found");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_statement_result_deserializes_rpc_shape() {
        let parsed: StatementResult =
            serde_json::from_value(json!({"status": "OK", "time": "1ms", "result": [1, 2]})).unwrap();
        assert!(parsed.is_ok());
        assert_eq!(parsed.into_result("q").unwrap(), json!([1, 2]));
    }

    #[test]
    fn test_notification_record_prefers_result_object() {
        let n = Notification {
            live_id: "l".to_string(),
            action: "DELETE".to_string(),
            result: Some(json!("orders:1")),
            before: Some(json!({"id": "orders:1", "a": 1})),
        };
        assert_eq!(n.record(), Some(&json!({"id": "orders:1", "a": 1})));

        let n = Notification {
            result: Some(json!({"id": 1})),
            ..n
        };
        assert_eq!(n.record(), Some(&json!({"id": 1})));
    }

    #[tokio::test]
    async fn test_query_one_returns_first_payload() {
        let db = fake::FakeDb::new();
        db.respond("INFO FOR ROOT", Ok(json!({"namespaces": {}})));
        let session = db.connector().connect().await.unwrap();

        let value = query_one(session.as_ref(), "INFO FOR ROOT").await.unwrap();
        assert_eq!(value, json!({"namespaces": {}}));
    }
}

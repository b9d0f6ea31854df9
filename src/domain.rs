use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================
// Table identity
// ============================================================

/// A table addressed by namespace, database and name.
///
/// The canonical string form `namespace:database:table` is what filters match
/// against and what every map in the crate is keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableIdentifier {
    pub namespace: String,
    pub database: String,
    pub table: String,
}

impl TableIdentifier {
    pub fn new(
        namespace: impl Into<String>,
        database: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            database: database.into(),
            table: table.into(),
        }
    }

    /// Parse `ns:db:table`. Returns `None` unless there are exactly three non-empty parts.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split(':');
        let (ns, db, table) = (parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() || ns.is_empty() || db.is_empty() || table.is_empty() {
            return None;
        }
        Some(Self::new(ns, db, table))
    }

    /// Canonical key, identical to the `Display` output.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for TableIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.namespace, self.database, self.table)
    }
}

/// A table discovered by the schema reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub id: TableIdentifier,
    /// `DEFINE TABLE ...` statement as reported by `INFO FOR DB`
    pub definition: String,
}

impl TableInfo {
    pub fn new(id: TableIdentifier) -> Self {
        Self {
            id,
            definition: String::new(),
        }
    }
}

// ============================================================
// Operations
// ============================================================

/// Shape-based classification of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperationKind {
    Graph,
    Relational,
    KeyValue,
    Document,
    Unknown,
}

impl OperationKind {
    pub const CLASSIFIED: [OperationKind; 4] = [
        OperationKind::Relational,
        OperationKind::KeyValue,
        OperationKind::Graph,
        OperationKind::Document,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Graph => "graph",
            Self::Relational => "relational",
            Self::KeyValue => "key_value",
            Self::Document => "document",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action carried by a change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationAction {
    Create,
    Update,
    Delete,
    Unknown,
}

impl OperationAction {
    pub const COUNTED: [OperationAction; 3] = [
        OperationAction::Create,
        OperationAction::Update,
        OperationAction::Delete,
    ];

    /// Map a notification action (`CREATE`, `update`, ...) onto a known action.
    pub fn from_notification(action: &str) -> Self {
        if action.eq_ignore_ascii_case("create") {
            Self::Create
        } else if action.eq_ignore_ascii_case("update") {
            Self::Update
        } else if action.eq_ignore_ascii_case("delete") {
            Self::Delete
        } else {
            Self::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for OperationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters for one (table, kind) pair accumulated from the live feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableOperationMetrics {
    pub table: TableIdentifier,
    pub kind: OperationKind,
    pub creates: u64,
    pub updates: u64,
    pub deletes: u64,
}

impl TableOperationMetrics {
    pub fn new(table: TableIdentifier, kind: OperationKind) -> Self {
        Self {
            table,
            kind,
            creates: 0,
            updates: 0,
            deletes: 0,
        }
    }

    pub fn count(&self, action: OperationAction) -> u64 {
        match action {
            OperationAction::Create => self.creates,
            OperationAction::Update => self.updates,
            OperationAction::Delete => self.deletes,
            OperationAction::Unknown => 0,
        }
    }
}

// ============================================================
// Side-table counters
// ============================================================

/// Per-kind counters for a single action, as stored on the side-table record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindCounts {
    pub relational: u64,
    pub key_value: u64,
    pub graph: u64,
    pub document: u64,
}

impl KindCounts {
    pub fn get(&self, kind: OperationKind) -> u64 {
        match kind {
            OperationKind::Relational => self.relational,
            OperationKind::KeyValue => self.key_value,
            OperationKind::Graph => self.graph,
            OperationKind::Document => self.document,
            OperationKind::Unknown => 0,
        }
    }
}

/// Counters read back from a provisioned side table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SideTableCounters {
    pub table: TableIdentifier,
    pub side_table: String,
    pub create: KindCounts,
    pub update: KindCounts,
    pub delete: KindCounts,
    pub last_update: Option<DateTime<Utc>>,
}

impl SideTableCounters {
    pub fn counts(&self, action: OperationAction) -> KindCounts {
        match action {
            OperationAction::Create => self.create,
            OperationAction::Update => self.update,
            OperationAction::Delete => self.delete,
            OperationAction::Unknown => KindCounts::default(),
        }
    }

    /// Every (action, kind, value) triple, twelve in total.
    pub fn iter(&self) -> impl Iterator<Item = (OperationAction, OperationKind, u64)> + '_ {
        OperationAction::COUNTED.into_iter().flat_map(move |action| {
            let counts = self.counts(action);
            OperationKind::CLASSIFIED
                .into_iter()
                .map(move |kind| (action, kind, counts.get(kind)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_identifier_display_and_parse() {
        let id = TableIdentifier::new("ns1", "db1", "orders");
        assert_eq!(id.to_string(), "ns1:db1:orders");
        assert_eq!(id.key(), "ns1:db1:orders");
        assert_eq!(TableIdentifier::parse("ns1:db1:orders"), Some(id));

        assert!(TableIdentifier::parse("ns1:db1").is_none());
        assert!(TableIdentifier::parse("ns1:db1:orders:extra").is_none());
        assert!(TableIdentifier::parse("ns1::orders").is_none());
    }

    #[test]
    fn test_action_from_notification() {
        assert_eq!(OperationAction::from_notification("CREATE"), OperationAction::Create);
        assert_eq!(OperationAction::from_notification("update"), OperationAction::Update);
        assert_eq!(OperationAction::from_notification("Delete"), OperationAction::Delete);
        assert_eq!(OperationAction::from_notification("KILLED"), OperationAction::Unknown);
        assert_eq!(OperationAction::from_notification(""), OperationAction::Unknown);
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(OperationKind::KeyValue.as_str(), "key_value");
        assert_eq!(OperationKind::Graph.to_string(), "graph");
    }

    #[test]
    fn test_side_table_counters_iter_covers_all_pairs() {
        let counters = SideTableCounters {
            table: TableIdentifier::new("ns", "db", "orders"),
            side_table: "_stats_orders".to_string(),
            create: KindCounts {
                relational: 3,
                ..Default::default()
            },
            update: KindCounts::default(),
            delete: KindCounts {
                graph: 1,
                ..Default::default()
            },
            last_update: None,
        };

        let all: Vec<_> = counters.iter().collect();
        assert_eq!(all.len(), 12);
        assert!(all.contains(&(OperationAction::Create, OperationKind::Relational, 3)));
        assert!(all.contains(&(OperationAction::Delete, OperationKind::Graph, 1)));
        assert_eq!(all.iter().map(|(_, _, v)| v).sum::<u64>(), 4);
    }
}

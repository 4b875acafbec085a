//! Change tracking for persisted entities.
//!
//! Every mutable entity keeps a snapshot of itself taken when it was loaded
//! or last saved. The persistence layer asks for the columns whose value
//! differs from that snapshot and writes only those. An entity that was never
//! marked (not loaded from storage yet) reports every mutable column.

use chrono::{DateTime, Utc};

/// A value bound to a changed column.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Bool(bool),
    Int(i32),
    BigInt(i64),
    Text(String),
    OptionalText(Option<String>),
    Timestamp(Option<DateTime<Utc>>),
}

/// A single changed column.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub column: &'static str,
    pub value: ColumnValue,
}

/// An entity whose mutations can be written back as a partial update.
pub trait Tracked: Clone + Send + Sync {
    /// Table backing the entity.
    const TABLE: &'static str;
    /// Whether the table carries an `updated_at` column.
    const HAS_UPDATED_AT: bool = true;

    fn id(&self) -> i32;

    /// Columns mutated since the entity was loaded or last saved.
    fn changes(&self) -> Vec<Change>;

    /// Take a new snapshot; afterwards `changes()` is empty.
    fn reset_mark(&mut self);

    fn is_changed(&self) -> bool {
        !self.changes().is_empty()
    }
}

/// Collects changed columns by comparing fields against a snapshot.
pub struct ChangeSet<'a, T> {
    snapshot: Option<&'a T>,
    changes: Vec<Change>,
}

impl<'a, T> ChangeSet<'a, T> {
    pub fn new(snapshot: Option<&'a T>) -> Self {
        Self {
            snapshot,
            changes: Vec::new(),
        }
    }

    pub fn field<V, F>(mut self, column: &'static str, current: &V, select: F) -> Self
    where
        V: PartialEq + Clone + Into<ColumnValue>,
        F: FnOnce(&T) -> &V,
    {
        let changed = match self.snapshot {
            Some(snapshot) => select(snapshot) != current,
            None => true,
        };
        if changed {
            self.changes.push(Change {
                column,
                value: current.clone().into(),
            });
        }
        self
    }

    pub fn finish(self) -> Vec<Change> {
        self.changes
    }
}

impl From<bool> for ColumnValue {
    fn from(v: bool) -> Self {
        ColumnValue::Bool(v)
    }
}

impl From<i32> for ColumnValue {
    fn from(v: i32) -> Self {
        ColumnValue::Int(v)
    }
}

impl From<i64> for ColumnValue {
    fn from(v: i64) -> Self {
        ColumnValue::BigInt(v)
    }
}

impl From<String> for ColumnValue {
    fn from(v: String) -> Self {
        ColumnValue::Text(v)
    }
}

impl From<Option<String>> for ColumnValue {
    fn from(v: Option<String>) -> Self {
        ColumnValue::OptionalText(v)
    }
}

impl From<Option<DateTime<Utc>>> for ColumnValue {
    fn from(v: Option<DateTime<Utc>>) -> Self {
        ColumnValue::Timestamp(v)
    }
}

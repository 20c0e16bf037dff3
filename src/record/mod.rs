//! The record store: a tabular, in-process key/value store with
//! per-table monotonic ids, predicate+limit queries, and per-table
//! reader/writer locking.
//!
//! Tables are addressed by name and created lazily on first access. Each
//! table guards its rows with its own `RwLock`: `get` takes a shared
//! lock, `set`/`del`/`next_id` take an exclusive one, so readers of one
//! table never block writers of another.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// A single row: a positional byte-slice vector keyed by `record_id`.
#[derive(Debug, Clone, Default)]
pub struct Record {
    record_id: u64,
    fields: Vec<Vec<u8>>,
}

impl Record {
    /// Creates a record with `field_count` empty fields.
    pub fn new(field_count: usize) -> Self {
        Self { record_id: 0, fields: vec![Vec::new(); field_count] }
    }

    pub fn record_id(&self) -> u64 {
        self.record_id
    }

    pub fn set_record_id(&mut self, id: u64) {
        self.record_id = id;
    }

    pub fn field(&self, index: usize) -> &[u8] {
        &self.fields[index]
    }

    pub fn set_field(&mut self, index: usize, value: impl Into<Vec<u8>>) {
        self.fields[index] = value.into();
    }

    pub fn field_u64(&self, index: usize) -> u64 {
        let mut buf = [0u8; 8];
        let field = &self.fields[index];
        buf[..field.len().min(8)].copy_from_slice(&field[..field.len().min(8)]);
        u64::from_be_bytes(buf)
    }

    pub fn set_field_u64(&mut self, index: usize, value: u64) {
        self.fields[index] = value.to_be_bytes().to_vec();
    }
}

/// A composable predicate for [`Table::get`]/[`Table::del`]. Predicates are
/// conjunctive: passing several means "match all of them".
pub enum Condition {
    /// Match a specific `record_id`.
    Id(u64),
    /// Match a field's bytes exactly.
    Eq(usize, Vec<u8>),
}

impl Condition {
    fn matches(&self, record: &Record) -> bool {
        match self {
            Condition::Id(id) => record.record_id == *id,
            Condition::Eq(field, value) => record.field(*field) == value.as_slice(),
        }
    }
}

/// Convenience constructor for [`Condition::Eq`].
pub fn eq(field: usize, value: impl Into<Vec<u8>>) -> Condition {
    Condition::Eq(field, value.into())
}

/// Convenience constructor for [`Condition::Id`].
pub fn id(value: u64) -> Condition {
    Condition::Id(value)
}

/// A bound on how many rows [`Table::get`] returns. A negative limit (or no
/// limit at all) means unbounded.
#[derive(Debug, Clone, Copy)]
pub struct Limit(pub i64);

/// One table in the store: a monotonic id counter plus a vector of rows
/// guarded by its own reader/writer lock.
pub struct Table {
    next_id: AtomicU64,
    rows: RwLock<Vec<Record>>,
}

impl Table {
    fn new() -> Self {
        Self { next_id: AtomicU64::new(1), rows: RwLock::new(Vec::new()) }
    }

    /// Returns the next unused id for this table. Monotonic, never reused.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Returns rows matching every condition, in insertion order, windowed
    /// by an optional limit. No conditions means a full scan.
    pub fn get(&self, conditions: &[Condition], limit: Option<Limit>) -> Vec<Record> {
        let rows = self.rows.read().expect("record table lock poisoned");
        let bound = match limit {
            Some(Limit(n)) if n >= 0 => Some(n as usize),
            _ => None,
        };

        let mut out = Vec::new();
        for record in rows.iter() {
            if conditions.iter().all(|c| c.matches(record)) {
                out.push(record.clone());
                if bound.is_some_and(|b| out.len() >= b) {
                    break;
                }
            }
        }
        out
    }

    /// Upserts a record by `record_id`. New rows preserve insertion order.
    pub fn set(&self, record: Record) {
        let mut rows = self.rows.write().expect("record table lock poisoned");
        if let Some(existing) = rows.iter_mut().find(|r| r.record_id == record.record_id) {
            *existing = record;
        } else {
            rows.push(record);
        }
    }

    /// Removes every row matching every condition.
    pub fn del(&self, conditions: &[Condition]) {
        let mut rows = self.rows.write().expect("record table lock poisoned");
        rows.retain(|record| !conditions.iter().all(|c| c.matches(record)));
    }
}

/// The Record Store: a registry of [`Table`]s created lazily by name.
#[derive(Clone, Default)]
pub struct Store {
    tables: Arc<RwLock<HashMap<String, Arc<Table>>>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the named table, creating it if this is its first use.
    pub fn table(&self, name: &str) -> Arc<Table> {
        if let Some(table) = self.tables.read().expect("store lock poisoned").get(name) {
            return table.clone();
        }

        let mut tables = self.tables.write().expect("store lock poisoned");
        tables.entry(name.to_string()).or_insert_with(|| Arc::new(Table::new())).clone()
    }
}

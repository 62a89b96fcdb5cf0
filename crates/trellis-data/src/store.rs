//! In-memory row storage shared by the sources of one container.

use std::collections::{BTreeMap, HashMap};

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use trellis_core::value::{FieldType, Value, Values};

use crate::selection::Selection;
use crate::source::Source;

#[derive(Debug, Default)]
struct Table {
    rows: BTreeMap<u64, Values>,
    next_seq: u64,
    next_id: i64,
}

/// Every table of a container. Obtained through [`MemoryStore::read`] or
/// [`MemoryStore::write`].
#[derive(Debug, Default)]
pub struct Tables {
    tables: HashMap<String, Table>,
}

impl Tables {
    /// Rows of `source` matching `selection`, in insertion order.
    pub fn select(&self, source: &Source, selection: &Selection) -> Vec<Values> {
        self.tables
            .get(source.name())
            .map(|table| {
                table
                    .rows
                    .values()
                    .filter(|row| selection.matches(row, |a| source.attribute_type(a)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Insert a normalized row, assigning an integer primary key when it is
    /// missing. Returns the stored row.
    pub(crate) fn insert(&mut self, source: &Source, mut row: Values) -> Values {
        let table = self.tables.entry(source.name().to_owned()).or_default();

        if let Some(pk) = source.primary_key() {
            if source.attribute_type(pk) == Some(FieldType::Integer) {
                match row.get(pk).and_then(Value::as_i64) {
                    Some(id) => table.next_id = table.next_id.max(id),
                    None => {
                        table.next_id = table.next_id.saturating_add(1);
                        row.insert(pk.to_owned(), Value::Integer(table.next_id));
                    }
                }
            }
        }

        table.next_seq = table.next_seq.saturating_add(1);
        table.rows.insert(table.next_seq, row.clone());
        row
    }

    /// Apply `changes` to every matching row. Returns `(before, after)` per
    /// row.
    pub(crate) fn update(
        &mut self,
        source: &Source,
        selection: &Selection,
        changes: &Values,
    ) -> Vec<(Values, Values)> {
        let Some(table) = self.tables.get_mut(source.name()) else {
            return Vec::new();
        };

        table
            .rows
            .values_mut()
            .filter(|row| selection.matches(row, |a| source.attribute_type(a)))
            .map(|row| {
                let before = row.clone();
                row.extend(changes.iter().map(|(k, v)| (k.clone(), v.clone())));
                (before, row.clone())
            })
            .collect()
    }

    /// Remove every matching row. Returns the removed rows.
    pub(crate) fn delete(&mut self, source: &Source, selection: &Selection) -> Vec<Values> {
        let Some(table) = self.tables.get_mut(source.name()) else {
            return Vec::new();
        };

        let doomed: Vec<u64> = table
            .rows
            .iter()
            .filter(|(_, row)| selection.matches(row, |a| source.attribute_type(a)))
            .map(|(seq, _)| *seq)
            .collect();

        doomed
            .into_iter()
            .filter_map(|seq| table.rows.remove(&seq))
            .collect()
    }
}

/// The single persistence backend: tables behind an async read-write lock.
/// Commands hold the write lock for their whole body, so each command is
/// atomic with respect to readers.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared access for queries.
    pub async fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().await
    }

    /// Exclusive access for commands.
    pub async fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().await
    }
}

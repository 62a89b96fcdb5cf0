//! Commands: the only way rows change.
//!
//! A command body runs synchronously against a [`CommandScope`] while the
//! container's store is write-locked. Every change it makes is recorded as
//! a [`Mutation`], which the subscription engine inspects once the command
//! has finished.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use trellis_core::value::{Value, Values};

use crate::error::DataError;
use crate::selection::Selection;
use crate::source::Source;
use crate::store::Tables;

/// A command body.
pub type CommandFn = Arc<dyn Fn(&mut CommandScope<'_>, Values) -> anyhow::Result<()> + Send + Sync>;

/// What a command does to its dataset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOptions {
    /// The command returns the rows it created or updated.
    pub provides_dataset: bool,
    /// The command changes or removes existing rows.
    pub performs_update: bool,
}

impl CommandOptions {
    /// Options of the default `create` command.
    pub const CREATE: Self = Self {
        provides_dataset: true,
        performs_update: false,
    };

    /// Options of the default `update` command.
    pub const UPDATE: Self = Self {
        provides_dataset: true,
        performs_update: true,
    };

    /// Options of the default `delete` command.
    pub const DELETE: Self = Self {
        provides_dataset: false,
        performs_update: true,
    };
}

/// Kind of change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    /// Rows were inserted.
    Create,
    /// Rows were changed.
    Update,
    /// Rows were removed.
    Delete,
}

/// One change to one source.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    /// The changed source.
    pub source: String,
    /// Kind of change.
    pub kind: MutationKind,
    /// Rows before the change (update and delete).
    pub pre: Vec<Values>,
    /// Rows after the change (create and update).
    pub post: Vec<Values>,
}

impl Mutation {
    /// Rows whose attributes decide whether a subscription is affected:
    /// the new rows of a create, the new and old rows of an update, the old
    /// rows of a delete.
    pub fn candidate_rows(&self) -> impl Iterator<Item = &Values> {
        let (post, pre): (&[Values], &[Values]) = match self.kind {
            MutationKind::Create => (&self.post, &[]),
            MutationKind::Update => (&self.post, &self.pre),
            MutationKind::Delete => (&[], &self.pre),
        };
        post.iter().chain(pre)
    }
}

/// What a command body works with.
pub struct CommandScope<'a> {
    tables: &'a mut Tables,
    source: &'a Source,
    selection: &'a Selection,
    command: &'a str,
    options: CommandOptions,
    mutations: Vec<Mutation>,
}

impl std::fmt::Debug for CommandScope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandScope")
            .field("source", &self.source.name())
            .field("command", &self.command)
            .field("selection", self.selection)
            .field("mutations", &self.mutations.len())
            .finish_non_exhaustive()
    }
}

impl<'a> CommandScope<'a> {
    pub(crate) fn new(
        tables: &'a mut Tables,
        source: &'a Source,
        selection: &'a Selection,
        command: &'a str,
        options: CommandOptions,
    ) -> Self {
        Self {
            tables,
            source,
            selection,
            command,
            options,
            mutations: Vec::new(),
        }
    }

    pub(crate) fn into_mutations(self) -> Vec<Mutation> {
        self.mutations
    }

    /// The source the command belongs to.
    pub const fn source(&self) -> &Source {
        self.source
    }

    /// The selection of the proxy the command was called on.
    pub const fn selection(&self) -> &Selection {
        self.selection
    }

    /// Rows in the command's selection.
    pub fn rows(&self) -> Vec<Values> {
        self.tables.select(self.source, self.selection)
    }

    /// Insert one row. Undeclared keys are dropped; declared values are
    /// coerced to their attribute types.
    pub fn insert(&mut self, values: Values) -> Result<Values, DataError> {
        let mut row = Values::new();
        for (attribute, field_type) in self.source.attributes() {
            let raw = values.get(attribute).cloned().unwrap_or_default();
            row.insert(attribute.clone(), self.coerce(attribute, *field_type, raw)?);
        }
        if self.source.has_timestamps() {
            let now = Value::DateTime(Utc::now().fixed_offset());
            for column in ["created_at", "updated_at"] {
                if row.get(column).is_none_or(Value::is_null) {
                    row.insert(column.to_owned(), now.clone());
                }
            }
        }

        let row = self.tables.insert(self.source, row);
        self.record(MutationKind::Create, Vec::new(), vec![row.clone()]);
        Ok(row)
    }

    /// Apply `changes` to every row in the selection. Returns the updated
    /// rows.
    pub fn update(&mut self, changes: Values) -> Result<Vec<Values>, DataError> {
        self.require_update()?;

        let mut normalized = Values::new();
        for (attribute, raw) in changes {
            if let Some(field_type) = self.source.attribute_type(&attribute) {
                let value = self.coerce(&attribute, field_type, raw)?;
                normalized.insert(attribute, value);
            }
        }
        if self.source.has_timestamps() {
            normalized.insert(
                "updated_at".to_owned(),
                Value::DateTime(Utc::now().fixed_offset()),
            );
        }

        let changed = self.tables.update(self.source, self.selection, &normalized);
        let (pre, post): (Vec<Values>, Vec<Values>) = changed.into_iter().unzip();
        if !post.is_empty() {
            self.record(MutationKind::Update, pre, post.clone());
        }
        Ok(post)
    }

    /// Remove every row in the selection. Returns the removed rows.
    pub fn delete(&mut self) -> Result<Vec<Values>, DataError> {
        self.require_update()?;

        let removed = self.tables.delete(self.source, self.selection);
        if !removed.is_empty() {
            self.record(MutationKind::Delete, removed.clone(), Vec::new());
        }
        Ok(removed)
    }

    fn require_update(&self) -> Result<(), DataError> {
        if self.options.performs_update {
            Ok(())
        } else {
            Err(DataError::Command {
                command: self.command.to_owned(),
                message: "command is not declared to perform updates".to_owned(),
            })
        }
    }

    fn coerce(
        &self,
        attribute: &str,
        field_type: trellis_core::value::FieldType,
        raw: Value,
    ) -> Result<Value, DataError> {
        field_type
            .coerce(raw)
            .map_err(|e| DataError::InvalidValue {
                source_name: self.source.name().to_owned(),
                attribute: attribute.to_owned(),
                message: e.to_string(),
            })
    }

    fn record(&mut self, kind: MutationKind, pre: Vec<Values>, post: Vec<Values>) {
        self.mutations.push(Mutation {
            source: self.source.name().to_owned(),
            kind,
            pre,
            post,
        });
    }
}

/// The body of the default `create` command.
pub(crate) fn create(scope: &mut CommandScope<'_>, values: Values) -> anyhow::Result<()> {
    scope.insert(values)?;
    Ok(())
}

/// The body of the default `update` command.
pub(crate) fn update(scope: &mut CommandScope<'_>, values: Values) -> anyhow::Result<()> {
    scope.update(values)?;
    Ok(())
}

/// The body of the default `delete` command.
pub(crate) fn delete(scope: &mut CommandScope<'_>, _values: Values) -> anyhow::Result<()> {
    scope.delete()?;
    Ok(())
}

//! Finalized sources, as produced by container finalization.

use std::collections::BTreeMap;
use std::fmt;

use trellis_core::value::{FieldType, Value};

use crate::command::{CommandFn, CommandOptions};
use crate::definition::{AssociationKind, Qualifications, QueryFn};
use crate::error::{DataError, LookupError};
use crate::selection::Selection;

/// A resolved association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Association {
    /// Key included rows are attached under: the target name for has-many,
    /// the target's singular name for belongs-to.
    pub name: String,
    /// Relationship side.
    pub kind: AssociationKind,
    /// Target source name.
    pub target: String,
    /// The foreign key column: on the target for has-many, on this source
    /// for belongs-to.
    pub foreign_key: String,
    /// Argument-less target query narrowing included rows.
    pub query: Option<String>,
}

/// A named query.
#[derive(Clone)]
pub struct Query {
    /// Number of positional arguments.
    pub arity: usize,
    pub(crate) build: QueryFn,
    /// Which mutations invalidate results of this query. `None` means no
    /// mutation ever does.
    pub qualifications: Option<Qualifications>,
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("arity", &self.arity)
            .field("qualifications", &self.qualifications)
            .finish_non_exhaustive()
    }
}

impl Query {
    /// Build the selection for `args`.
    pub fn selection(&self, name: &str, args: &[Value]) -> Result<Selection, DataError> {
        if args.len() != self.arity {
            return Err(DataError::Arity {
                query: name.to_owned(),
                expected: self.arity,
                got: args.len(),
            });
        }
        Ok((self.build)(args))
    }
}

/// A named command.
#[derive(Clone)]
pub struct Command {
    /// What the command does to its dataset.
    pub options: CommandOptions,
    pub(crate) run: CommandFn,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// A finalized source.
#[derive(Debug, Clone)]
pub struct Source {
    pub(crate) name: String,
    pub(crate) singular: String,
    pub(crate) primary_key: Option<String>,
    pub(crate) attributes: BTreeMap<String, FieldType>,
    pub(crate) timestamps: bool,
    pub(crate) associations: Vec<Association>,
    pub(crate) queries: BTreeMap<String, Query>,
    pub(crate) commands: BTreeMap<String, Command>,
    pub(crate) default_query: Option<String>,
}

impl Source {
    /// The source name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The singular name.
    pub fn singular(&self) -> &str {
        &self.singular
    }

    /// The primary key column, if any.
    pub fn primary_key(&self) -> Option<&str> {
        self.primary_key.as_deref()
    }

    /// The primary key column, falling back to `id`.
    pub fn key_column(&self) -> &str {
        self.primary_key.as_deref().unwrap_or("id")
    }

    /// Declared attributes (including the primary key, foreign keys and
    /// timestamps).
    pub const fn attributes(&self) -> &BTreeMap<String, FieldType> {
        &self.attributes
    }

    /// The declared type of `attribute`.
    pub fn attribute_type(&self, attribute: &str) -> Option<FieldType> {
        self.attributes.get(attribute).copied()
    }

    /// Whether inserts and updates maintain timestamps.
    pub const fn has_timestamps(&self) -> bool {
        self.timestamps
    }

    /// Resolved associations.
    pub fn associations(&self) -> &[Association] {
        &self.associations
    }

    /// The association called `name`.
    pub fn association(&self, name: &str) -> Result<&Association, LookupError> {
        self.associations
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| LookupError::Association {
                source_name: self.name.clone(),
                association: name.to_owned(),
            })
    }

    /// The query called `name`.
    pub fn query(&self, name: &str) -> Result<&Query, LookupError> {
        self.queries.get(name).ok_or_else(|| LookupError::Query {
            source_name: self.name.clone(),
            query: name.to_owned(),
        })
    }

    /// Query names.
    pub fn query_names(&self) -> impl Iterator<Item = &str> {
        self.queries.keys().map(String::as_str)
    }

    /// The command called `name`.
    pub fn command(&self, name: &str) -> Result<&Command, LookupError> {
        self.commands.get(name).ok_or_else(|| LookupError::Command {
            source_name: self.name.clone(),
            command: name.to_owned(),
        })
    }

    /// The query applied to every lookup, if declared.
    pub fn default_query(&self) -> Option<&str> {
        self.default_query.as_deref()
    }
}

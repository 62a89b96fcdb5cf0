//! Declarative source definitions.
//!
//! A [`SourceDefinition`] describes one data source: its attributes,
//! associations, named queries, subscription qualifications and commands.
//! Definitions are plain data; a [`Container`](crate::container::Container)
//! finalizes them into sources.
//!
//! ```
//! use trellis_core::value::FieldType;
//! use trellis_data::definition::{Qualifier, SourceDefinition};
//! use trellis_data::selection::Selection;
//!
//! let posts = SourceDefinition::new("posts")
//!     .primary_id()
//!     .timestamps()
//!     .attribute("title", FieldType::String)
//!     .attribute("published", FieldType::Boolean)
//!     .has_many("comments")
//!     .query("published", 0, |_| Selection::all().where_eq("published", true))
//!     .subscribe("published", [("published", Qualifier::Literal(true.into()))]);
//! # let _ = posts;
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use trellis_core::value::{FieldType, Value};

use crate::command::{CommandFn, CommandOptions, CommandScope};
use crate::selection::Selection;

/// Builds the selection for a query from its arguments.
pub type QueryFn = Arc<dyn Fn(&[Value]) -> Selection + Send + Sync>;

/// How a qualification value is obtained.
#[derive(Debug, Clone, PartialEq)]
pub enum Qualifier {
    /// A fixed value.
    Literal(Value),
    /// The n-th argument the query was called with.
    Arg(usize),
}

/// Attribute qualifications for a query. Attributes not listed are
/// wildcards.
pub type Qualifications = BTreeMap<String, Qualifier>;

/// Which side of a relationship an association is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationKind {
    /// The target holds a foreign key pointing at this source.
    HasMany,
    /// This source holds a foreign key pointing at the target.
    BelongsTo,
}

#[derive(Debug, Clone)]
pub(crate) struct DeclaredAssociation {
    pub(crate) kind: AssociationKind,
    pub(crate) target: String,
    pub(crate) query: Option<String>,
}

#[derive(Clone)]
pub(crate) struct DeclaredQuery {
    pub(crate) arity: usize,
    pub(crate) build: QueryFn,
}

#[derive(Clone)]
pub(crate) struct DeclaredCommand {
    pub(crate) options: CommandOptions,
    pub(crate) run: CommandFn,
}

/// The declaration of one source.
#[derive(Clone)]
pub struct SourceDefinition {
    pub(crate) name: String,
    pub(crate) singular: Option<String>,
    pub(crate) primary_key: Option<(String, FieldType)>,
    pub(crate) timestamps: bool,
    pub(crate) attributes: Vec<(String, FieldType)>,
    pub(crate) associations: Vec<DeclaredAssociation>,
    pub(crate) queries: BTreeMap<String, DeclaredQuery>,
    pub(crate) qualifications: BTreeMap<String, Qualifications>,
    pub(crate) commands: BTreeMap<String, DeclaredCommand>,
    pub(crate) default_query: Option<String>,
}

impl fmt::Debug for SourceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceDefinition")
            .field("name", &self.name)
            .field("primary_key", &self.primary_key)
            .field("attributes", &self.attributes)
            .field("associations", &self.associations)
            .field("queries", &self.queries.keys().collect::<Vec<_>>())
            .field("commands", &self.commands.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl SourceDefinition {
    /// An empty definition for the source `name` (plural, e.g. `posts`).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            singular: None,
            primary_key: None,
            timestamps: false,
            attributes: Vec::new(),
            associations: Vec::new(),
            queries: BTreeMap::new(),
            qualifications: BTreeMap::new(),
            commands: BTreeMap::new(),
            default_query: None,
        }
    }

    /// The source name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Use an auto-incrementing integer `id` as the primary key.
    #[must_use]
    pub fn primary_id(self) -> Self {
        self.primary_key("id", FieldType::Integer)
    }

    /// Use `field` as the primary key. Values are supplied by the caller.
    #[must_use]
    pub fn primary_key(mut self, field: impl Into<String>, field_type: FieldType) -> Self {
        self.primary_key = Some((field.into(), field_type));
        self
    }

    /// Add `created_at` and `updated_at`, maintained by every insert and
    /// update.
    #[must_use]
    pub const fn timestamps(mut self) -> Self {
        self.timestamps = true;
        self
    }

    /// Declare an attribute.
    #[must_use]
    pub fn attribute(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.attributes.push((name.into(), field_type));
        self
    }

    /// Override the singular name (defaults to the name without its plural
    /// suffix).
    #[must_use]
    pub fn singular(mut self, singular: impl Into<String>) -> Self {
        self.singular = Some(singular.into());
        self
    }

    /// The target source holds `<singular>_id` pointing at this source.
    #[must_use]
    pub fn has_many(self, target: impl Into<String>) -> Self {
        self.associate(AssociationKind::HasMany, target.into(), None)
    }

    /// Like [`Self::has_many`], but included rows are narrowed by the
    /// target's argument-less `query`.
    #[must_use]
    pub fn has_many_with_query(self, target: impl Into<String>, query: impl Into<String>) -> Self {
        self.associate(AssociationKind::HasMany, target.into(), Some(query.into()))
    }

    /// This source holds `<target singular>_id` pointing at `target`.
    #[must_use]
    pub fn belongs_to(self, target: impl Into<String>) -> Self {
        self.associate(AssociationKind::BelongsTo, target.into(), None)
    }

    fn associate(mut self, kind: AssociationKind, target: String, query: Option<String>) -> Self {
        self.associations.push(DeclaredAssociation {
            kind,
            target,
            query,
        });
        self
    }

    /// Declare a named query taking `arity` positional arguments.
    #[must_use]
    pub fn query<F>(mut self, name: impl Into<String>, arity: usize, build: F) -> Self
    where
        F: Fn(&[Value]) -> Selection + Send + Sync + 'static,
    {
        self.queries.insert(
            name.into(),
            DeclaredQuery {
                arity,
                build: Arc::new(build),
            },
        );
        self
    }

    /// Declare which mutations can change the result of `query`: those
    /// touching a row whose attributes equal every qualification.
    #[must_use]
    pub fn subscribe<I, K>(mut self, query: impl Into<String>, qualifications: I) -> Self
    where
        I: IntoIterator<Item = (K, Qualifier)>,
        K: Into<String>,
    {
        self.qualifications.insert(
            query.into(),
            qualifications
                .into_iter()
                .map(|(attribute, qualifier)| (attribute.into(), qualifier))
                .collect(),
        );
        self
    }

    /// Declare a command, replacing a default one of the same name.
    #[must_use]
    pub fn command<F>(mut self, name: impl Into<String>, options: CommandOptions, run: F) -> Self
    where
        F: Fn(&mut CommandScope<'_>, trellis_core::value::Values) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        self.commands.insert(
            name.into(),
            DeclaredCommand {
                options,
                run: Arc::new(run),
            },
        );
        self
    }

    /// Apply the named argument-less query to every lookup of this source.
    #[must_use]
    pub fn default_query(mut self, query: impl Into<String>) -> Self {
        self.default_query = Some(query.into());
        self
    }
}

/// The default singular form of a plural source name.
pub fn singularize(name: &str) -> String {
    if let Some(stem) = name.strip_suffix("ies") {
        format!("{stem}y")
    } else if let Some(stem) = name.strip_suffix('s') {
        stem.to_owned()
    } else {
        name.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn singular_names() {
        assert_eq!(singularize("posts"), "post");
        assert_eq!(singularize("categories"), "category");
        assert_eq!(singularize("sheep"), "sheep");
    }

    #[test]
    fn subscribe_collects_qualifications() {
        let def = SourceDefinition::new("posts")
            .query("by_author", 1, |args| {
                Selection::all().where_eq("author", args.first().cloned().unwrap_or_default())
            })
            .subscribe("by_author", [("author", Qualifier::Arg(0))]);

        assert_eq!(
            def.qualifications["by_author"].get("author"),
            Some(&Qualifier::Arg(0))
        );
    }
}

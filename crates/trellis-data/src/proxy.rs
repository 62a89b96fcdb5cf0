//! Proxies: lazily evaluated queries over one source.
//!
//! A [`Proxy`] accumulates a selection, includes and every query it was
//! built from. Nothing touches the store until [`Proxy::to_a`],
//! [`Proxy::one`], [`Proxy::count`] or a command is called.

use std::sync::Arc;

use tracing::{debug, warn};
use trellis_core::value::{Value, Values};

use crate::command::{CommandScope, Mutation, MutationKind};
use crate::container::Container;
use crate::definition::AssociationKind;
use crate::error::DataError;
use crate::selection::Selection;
use crate::source::Source;
use crate::store::Tables;
use crate::subscription::{Include, QueryCall, Subscription, SubscriptionKey};

/// A query over one source.
#[derive(Debug, Clone)]
pub struct Proxy {
    container: Container,
    source: Arc<Source>,
    queries: Vec<QueryCall>,
    selection: Selection,
    includes: Vec<Include>,
}

impl Proxy {
    pub(crate) fn new(container: Container, source: Arc<Source>) -> Result<Self, DataError> {
        let selection = base_selection(&source)?;
        Ok(Self {
            container,
            source,
            queries: Vec::new(),
            selection,
            includes: Vec::new(),
        })
    }

    /// The source this proxy reads.
    pub fn source(&self) -> &Source {
        &self.source
    }

    /// The accumulated selection.
    pub const fn selection(&self) -> &Selection {
        &self.selection
    }

    /// The included associations.
    pub fn includes(&self) -> &[Include] {
        &self.includes
    }

    /// The queries applied so far, in order.
    pub fn queries(&self) -> &[QueryCall] {
        &self.queries
    }

    /// Narrow by the named query. Chained queries all apply.
    pub fn query(mut self, name: &str, args: Vec<Value>) -> Result<Self, DataError> {
        let selection = self.source.query(name)?.selection(name, &args)?;
        self.selection = self.selection.and(selection);
        self.queries.push(QueryCall::new(name, args));
        Ok(self)
    }

    /// Attach the rows of `association` to every result.
    pub fn including(self, association: &str) -> Result<Self, DataError> {
        self.including_with(association, Ok)
    }

    /// Attach the rows of `association`, shaped by `nested`: queries called
    /// on the nested proxy narrow the included rows, and its includes are
    /// attached to them.
    pub fn including_with<F>(mut self, association: &str, nested: F) -> Result<Self, DataError>
    where
        F: FnOnce(Self) -> Result<Self, DataError>,
    {
        let target = self.source.association(association)?.target.clone();
        let nested = nested(self.container.source(&target)?)?;

        self.includes.push(Include {
            association: association.to_owned(),
            target,
            queries: nested.queries,
            includes: nested.includes,
        });
        Ok(self)
    }

    /// Replace the includes with `includes`, checking every association and
    /// query they name.
    pub fn with_includes(mut self, includes: Vec<Include>) -> Result<Self, DataError> {
        validate_includes(&self.container, &self.source, &includes)?;
        self.includes = includes;
        Ok(self)
    }

    /// Every matching row, with includes attached.
    pub async fn to_a(&self) -> Result<Vec<Values>, DataError> {
        let tables = self.container.store().read().await;
        let rows = tables.select(&self.source, &self.selection);
        attach_includes(&self.container, &tables, &self.source, rows, &self.includes)
    }

    /// The first matching row.
    pub async fn one(&self) -> Result<Option<Values>, DataError> {
        Ok(self.to_a().await?.into_iter().next())
    }

    /// Number of matching rows.
    pub async fn count(&self) -> Result<usize, DataError> {
        let tables = self.container.store().read().await;
        Ok(tables.select(&self.source, &self.selection).len())
    }

    /// Run the command `name` over this proxy's selection.
    ///
    /// Returns the created or updated rows for commands that provide a
    /// dataset, nothing otherwise. Subscribers are told about every change
    /// the command made, even when it failed part way.
    pub async fn command(&self, name: &str, values: Values) -> Result<Vec<Values>, DataError> {
        let command = self.source.command(name)?.clone();

        let (result, mutations) = {
            let mut tables = self.container.store().write().await;
            let mut scope =
                CommandScope::new(&mut tables, &self.source, &self.selection, name, command.options);
            let result = (command.run)(&mut scope, values);
            (result, scope.into_mutations())
        };

        debug!(
            source = %self.source.name(),
            command = name,
            mutations = mutations.len(),
            "command performed"
        );
        self.notify(&mutations).await;
        result.map_err(|error| command_error(name, error))?;

        if !command.options.provides_dataset {
            return Ok(Vec::new());
        }
        Ok(mutations
            .into_iter()
            .filter(|m| m.source == self.source.name() && m.kind != MutationKind::Delete)
            .flat_map(|m| m.post)
            .collect())
    }

    /// Insert one row.
    pub async fn create(&self, values: Values) -> Result<Vec<Values>, DataError> {
        self.command("create", values).await
    }

    /// Update every matching row.
    pub async fn update(&self, values: Values) -> Result<Vec<Values>, DataError> {
        self.command("update", values).await
    }

    /// Delete every matching row.
    pub async fn delete(&self) -> Result<Vec<Values>, DataError> {
        self.command("delete", Values::new()).await
    }

    /// Subscribe `subscriber` to this proxy's results. `handler` receives
    /// the fresh results whenever a mutation may have changed them.
    pub async fn subscribe(
        &self,
        subscriber: impl Into<String>,
        handler: impl Into<String>,
        payload: Value,
    ) -> Result<SubscriptionKey, DataError> {
        let subscription = Subscription {
            subscriber: subscriber.into(),
            source: self.source.name().to_owned(),
            queries: self.queries.clone(),
            includes: self.includes.clone(),
            handler: handler.into(),
            payload,
        };
        self.container.subscribers().subscribe(subscription).await
    }

    async fn notify(&self, mutations: &[Mutation]) {
        let subscribers = self.container.subscribers();
        for mutation in mutations {
            if let Err(error) = subscribers.did_mutate(&self.container, mutation).await {
                warn!(
                    source = %mutation.source,
                    error = %error,
                    "failed to process mutation for subscribers"
                );
            }
        }
    }
}

fn command_error(command: &str, error: anyhow::Error) -> DataError {
    match error.downcast::<DataError>() {
        Ok(error) => error,
        Err(error) => DataError::Command {
            command: command.to_owned(),
            message: format!("{error:#}"),
        },
    }
}

/// The selection every lookup of `source` starts from.
fn base_selection(source: &Source) -> Result<Selection, DataError> {
    match source.default_query() {
        Some(name) => source.query(name)?.selection(name, &[]),
        None => Ok(Selection::all()),
    }
}

fn validate_includes(
    container: &Container,
    source: &Source,
    includes: &[Include],
) -> Result<(), DataError> {
    for include in includes {
        let association = source.association(&include.association)?;
        if association.target != include.target {
            return Err(DataError::Definition(format!(
                "association `{}.{}` targets `{}`, not `{}`",
                source.name(),
                include.association,
                association.target,
                include.target
            )));
        }
        let target = container.finalized(&include.target)?;
        for call in &include.queries {
            target.query(&call.name)?.selection(&call.name, &call.args)?;
        }
        validate_includes(container, target, &include.includes)?;
    }
    Ok(())
}

fn attach_includes(
    container: &Container,
    tables: &Tables,
    source: &Source,
    mut rows: Vec<Values>,
    includes: &[Include],
) -> Result<Vec<Values>, DataError> {
    for include in includes {
        let association = source.association(&include.association)?;
        let target = container.finalized(&association.target)?;

        let mut selection = base_selection(target)?;
        if let Some(query) = &association.query {
            selection = selection.and(target.query(query)?.selection(query, &[])?);
        }
        for call in &include.queries {
            selection = selection.and(target.query(&call.name)?.selection(&call.name, &call.args)?);
        }

        match association.kind {
            AssociationKind::HasMany => {
                let keys = column_values(&rows, source.key_column());
                let selection = selection.where_in(association.foreign_key.clone(), keys);
                let children = tables.select(target, &selection);
                let children = attach_includes(container, tables, target, children, &include.includes)?;

                for row in &mut rows {
                    let key = row.get(source.key_column()).cloned().unwrap_or_default();
                    let matched = children
                        .iter()
                        .filter(|child| !key.is_null() && child.get(&association.foreign_key) == Some(&key))
                        .cloned()
                        .map(Value::Map)
                        .collect();
                    row.insert(association.name.clone(), Value::List(matched));
                }
            }
            AssociationKind::BelongsTo => {
                let keys = column_values(&rows, &association.foreign_key);
                let selection = selection.where_in(target.key_column().to_owned(), keys);
                let parents = tables.select(target, &selection);
                let parents = attach_includes(container, tables, target, parents, &include.includes)?;

                for row in &mut rows {
                    let key = row.get(&association.foreign_key).cloned().unwrap_or_default();
                    let parent = parents
                        .iter()
                        .find(|parent| !key.is_null() && parent.get(target.key_column()) == Some(&key))
                        .cloned()
                        .map_or(Value::Null, Value::Map);
                    row.insert(association.name.clone(), parent);
                }
            }
        }
    }
    Ok(rows)
}

/// Non-null values of `column` across `rows`.
pub(crate) fn column_values(rows: &[Values], column: &str) -> Vec<Value> {
    let mut values: Vec<Value> = Vec::new();
    for value in rows.iter().filter_map(|row| row.get(column)) {
        if !value.is_null() && !values.contains(value) {
            values.push(value.clone());
        }
    }
    values
}

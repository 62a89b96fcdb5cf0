//! Containers: a store plus the finalized sources living in it.
//!
//! Finalization runs once, when the container is built:
//!
//! 1. every `has_many` gets its inverse `belongs_to` on the target;
//! 2. associations to undefined sources are dropped with a warning;
//! 3. primary key, foreign key and timestamp attributes are declared;
//! 4. a `by_<attribute>` query is added for every attribute;
//! 5. default `create`, `update` and `delete` commands are added;
//! 6. qualifications, association queries and default queries are checked.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};
use trellis_core::value::{FieldType, Value};

use crate::command::{self, CommandFn, CommandOptions};
use crate::definition::{
    AssociationKind, DeclaredAssociation, Qualifier, SourceDefinition, singularize,
};
use crate::error::{DataError, LookupError};
use crate::proxy::Proxy;
use crate::selection::Selection;
use crate::source::{Association, Command, Query, Source};
use crate::store::MemoryStore;
use crate::subscribers::Subscribers;
use crate::subscription::Subscription;

struct Inner {
    sources: BTreeMap<String, Arc<Source>>,
    store: MemoryStore,
    subscribers: Arc<Subscribers>,
}

/// A store and its sources. Cheap to clone.
#[derive(Clone)]
pub struct Container {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("sources", &self.inner.sources.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Container {
    /// Finalize `definitions` into a container whose mutations are reported
    /// to `subscribers`.
    pub fn new(
        definitions: impl IntoIterator<Item = SourceDefinition>,
        subscribers: Arc<Subscribers>,
    ) -> Result<Self, DataError> {
        let sources = finalize(definitions.into_iter().collect())?;
        debug!(sources = ?sources.keys().collect::<Vec<_>>(), "container finalized");
        Ok(Self {
            inner: Arc::new(Inner {
                sources,
                store: MemoryStore::new(),
                subscribers,
            }),
        })
    }

    /// A proxy over every row of `name`, with its default query applied.
    pub fn source(&self, name: &str) -> Result<Proxy, DataError> {
        let source = self.finalized(name)?;
        Proxy::new(self.clone(), Arc::clone(source))
    }

    /// The finalized source `name`.
    pub fn finalized(&self, name: &str) -> Result<&Arc<Source>, LookupError> {
        self.inner
            .sources
            .get(name)
            .ok_or_else(|| LookupError::Source(name.to_owned()))
    }

    /// Whether the container holds a source called `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.sources.contains_key(name)
    }

    /// Every finalized source.
    pub fn sources(&self) -> impl Iterator<Item = &Arc<Source>> {
        self.inner.sources.values()
    }

    /// The backing store.
    pub fn store(&self) -> &MemoryStore {
        &self.inner.store
    }

    /// The subscription engine mutations are reported to.
    pub fn subscribers(&self) -> &Arc<Subscribers> {
        &self.inner.subscribers
    }

    /// Rebuild the proxy a subscription was created from.
    pub fn resolve(&self, subscription: &Subscription) -> Result<Proxy, DataError> {
        let mut proxy = self.source(&subscription.source)?;
        for call in &subscription.queries {
            proxy = proxy.query(&call.name, call.args.clone())?;
        }
        proxy.with_includes(subscription.includes.clone())
    }
}

fn finalize(definitions: Vec<SourceDefinition>) -> Result<BTreeMap<String, Arc<Source>>, DataError> {
    let mut definitions: BTreeMap<String, SourceDefinition> = definitions
        .into_iter()
        .map(|definition| (definition.name.clone(), definition))
        .collect();

    add_inverse_associations(&mut definitions);
    drop_dangling_associations(&mut definitions);

    let singulars: BTreeMap<String, String> = definitions
        .values()
        .map(|d| (d.name.clone(), singular_of(d)))
        .collect();
    let key_types: BTreeMap<String, FieldType> = definitions
        .values()
        .map(|d| {
            let key_type = d.primary_key.as_ref().map_or(FieldType::Integer, |(_, t)| *t);
            (d.name.clone(), key_type)
        })
        .collect();

    let mut sources = BTreeMap::new();
    for definition in definitions.values() {
        let source = build_source(definition, &singulars, &key_types)?;
        sources.insert(source.name.clone(), source);
    }

    for source in sources.values() {
        validate_association_queries(source, &sources)?;
    }

    Ok(sources.into_iter().map(|(name, s)| (name, Arc::new(s))).collect())
}

fn singular_of(definition: &SourceDefinition) -> String {
    definition
        .singular
        .clone()
        .unwrap_or_else(|| singularize(&definition.name))
}

fn add_inverse_associations(definitions: &mut BTreeMap<String, SourceDefinition>) {
    let inverses: Vec<(String, String)> = definitions
        .values()
        .flat_map(|d| {
            d.associations
                .iter()
                .filter(|a| a.kind == AssociationKind::HasMany)
                .map(|a| (a.target.clone(), d.name.clone()))
        })
        .collect();

    for (child, parent) in inverses {
        let Some(definition) = definitions.get_mut(&child) else {
            continue;
        };
        let declared = definition
            .associations
            .iter()
            .any(|a| a.kind == AssociationKind::BelongsTo && a.target == parent);
        if !declared {
            definition.associations.push(DeclaredAssociation {
                kind: AssociationKind::BelongsTo,
                target: parent,
                query: None,
            });
        }
    }
}

fn drop_dangling_associations(definitions: &mut BTreeMap<String, SourceDefinition>) {
    let names: Vec<String> = definitions.keys().cloned().collect();
    for definition in definitions.values_mut() {
        let source_name = definition.name.clone();
        definition.associations.retain(|a| {
            let known = names.contains(&a.target);
            if !known {
                warn!(
                    source = %source_name,
                    target = %a.target,
                    "dropping association to undefined source"
                );
            }
            known
        });
    }
}

fn build_source(
    definition: &SourceDefinition,
    singulars: &BTreeMap<String, String>,
    key_types: &BTreeMap<String, FieldType>,
) -> Result<Source, DataError> {
    let singular = singular_of(definition);

    let mut attributes = BTreeMap::new();
    if let Some((key, key_type)) = &definition.primary_key {
        attributes.insert(key.clone(), *key_type);
    }
    for (name, field_type) in &definition.attributes {
        attributes.insert(name.clone(), *field_type);
    }

    let associations = resolve_associations(definition, &singular, singulars, key_types, &mut attributes);

    if definition.timestamps {
        attributes.insert("created_at".to_owned(), FieldType::Datetime);
        attributes.insert("updated_at".to_owned(), FieldType::Datetime);
    }

    let queries = build_queries(definition, &attributes)?;

    Ok(Source {
        name: definition.name.clone(),
        singular,
        primary_key: definition.primary_key.as_ref().map(|(key, _)| key.clone()),
        attributes,
        timestamps: definition.timestamps,
        associations,
        queries,
        commands: build_commands(definition),
        default_query: definition.default_query.clone(),
    })
}

fn resolve_associations(
    definition: &SourceDefinition,
    singular: &str,
    singulars: &BTreeMap<String, String>,
    key_types: &BTreeMap<String, FieldType>,
    attributes: &mut BTreeMap<String, FieldType>,
) -> Vec<Association> {
    definition
        .associations
        .iter()
        .map(|declared| match declared.kind {
            AssociationKind::HasMany => Association {
                name: declared.target.clone(),
                kind: AssociationKind::HasMany,
                target: declared.target.clone(),
                foreign_key: format!("{singular}_id"),
                query: declared.query.clone(),
            },
            AssociationKind::BelongsTo => {
                let target_singular = singulars
                    .get(&declared.target)
                    .cloned()
                    .unwrap_or_else(|| singularize(&declared.target));
                let foreign_key = format!("{target_singular}_id");
                let key_type = key_types
                    .get(&declared.target)
                    .copied()
                    .unwrap_or(FieldType::Integer);
                attributes.entry(foreign_key.clone()).or_insert(key_type);
                Association {
                    name: target_singular,
                    kind: AssociationKind::BelongsTo,
                    target: declared.target.clone(),
                    foreign_key,
                    query: declared.query.clone(),
                }
            }
        })
        .collect()
}

fn build_queries(
    definition: &SourceDefinition,
    attributes: &BTreeMap<String, FieldType>,
) -> Result<BTreeMap<String, Query>, DataError> {
    let mut queries: BTreeMap<String, Query> = definition
        .queries
        .iter()
        .map(|(name, declared)| {
            let query = Query {
                arity: declared.arity,
                build: Arc::clone(&declared.build),
                qualifications: None,
            };
            (name.clone(), query)
        })
        .collect();

    for attribute in attributes.keys() {
        let name = format!("by_{attribute}");
        if queries.contains_key(&name) {
            continue;
        }
        let column = attribute.clone();
        queries.insert(
            name,
            Query {
                arity: 1,
                build: Arc::new(move |args: &[Value]| {
                    Selection::all().where_eq(column.clone(), args.first().cloned().unwrap_or_default())
                }),
                qualifications: Some(
                    [(attribute.clone(), Qualifier::Arg(0))].into_iter().collect(),
                ),
            },
        );
    }

    for (query_name, qualifications) in &definition.qualifications {
        let query = queries.get_mut(query_name).ok_or_else(|| {
            DataError::Definition(format!(
                "`{}` subscribes unknown query `{query_name}`",
                definition.name
            ))
        })?;
        for (attribute, qualifier) in qualifications {
            if !attributes.contains_key(attribute) {
                return Err(DataError::Definition(format!(
                    "`{}.{query_name}` qualifies unknown attribute `{attribute}`",
                    definition.name
                )));
            }
            if let Qualifier::Arg(index) = qualifier {
                if *index >= query.arity {
                    return Err(DataError::Definition(format!(
                        "`{}.{query_name}` qualifies `{attribute}` with argument {index}, \
                         but the query takes {}",
                        definition.name, query.arity
                    )));
                }
            }
        }
        query.qualifications = Some(qualifications.clone());
    }

    if let Some(default_query) = &definition.default_query {
        match queries.get(default_query) {
            Some(query) if query.arity == 0 => {}
            Some(_) => {
                return Err(DataError::Definition(format!(
                    "default query `{}.{default_query}` must take no arguments",
                    definition.name
                )));
            }
            None => {
                return Err(DataError::Definition(format!(
                    "unknown default query `{}.{default_query}`",
                    definition.name
                )));
            }
        }
    }

    Ok(queries)
}

fn build_commands(definition: &SourceDefinition) -> BTreeMap<String, Command> {
    let defaults: [(&str, CommandOptions, CommandFn); 3] = [
        ("create", CommandOptions::CREATE, Arc::new(command::create)),
        ("update", CommandOptions::UPDATE, Arc::new(command::update)),
        ("delete", CommandOptions::DELETE, Arc::new(command::delete)),
    ];

    let mut commands: BTreeMap<String, Command> = defaults
        .into_iter()
        .map(|(name, options, run)| (name.to_owned(), Command { options, run }))
        .collect();
    for (name, declared) in &definition.commands {
        commands.insert(
            name.clone(),
            Command {
                options: declared.options,
                run: Arc::clone(&declared.run),
            },
        );
    }
    commands
}

fn validate_association_queries(
    source: &Source,
    sources: &BTreeMap<String, Source>,
) -> Result<(), DataError> {
    for association in &source.associations {
        let Some(query_name) = &association.query else {
            continue;
        };
        let arity = sources
            .get(&association.target)
            .and_then(|target| target.queries.get(query_name))
            .map(|query| query.arity);
        if arity != Some(0) {
            return Err(DataError::Definition(format!(
                "association `{}.{}` needs an argument-less query `{}.{query_name}`",
                source.name, association.name, association.target
            )));
        }
    }
    Ok(())
}

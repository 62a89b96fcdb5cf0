//! Deciding whether a mutation can change a subscription's results.
//!
//! A subscription is affected when the mutated source is its root and a
//! changed row satisfies the query's qualifications, or when the mutated
//! source is reachable through its includes and the changed rows lead back,
//! one association at a time, to a root row satisfying them.

use trellis_core::value::Values;

use crate::command::Mutation;
use crate::container::Container;
use crate::definition::{AssociationKind, Qualifier};
use crate::error::DataError;
use crate::proxy::column_values;
use crate::selection::Selection;
use crate::source::{Association, Source};
use crate::store::Tables;
use crate::subscription::{Include, QueryCall, Subscription};

/// The qualification of a subscription as a selection over root rows:
/// the conjunction of every applied query's qualifications. `None` when no
/// mutation can affect it, which is the case as soon as one applied query
/// declares no qualifications.
pub fn qualification(source: &Source, subscription: &Subscription) -> Result<Option<Selection>, DataError> {
    let mut selection = Selection::all();
    for call in &subscription.queries {
        let Some(qualified) = qualify(source, call)? else {
            return Ok(None);
        };
        selection = selection.and(qualified);
    }
    Ok(Some(selection))
}

fn qualify(source: &Source, call: &QueryCall) -> Result<Option<Selection>, DataError> {
    let query = source.query(&call.name)?;
    let Some(qualifications) = &query.qualifications else {
        return Ok(None);
    };

    let mut selection = Selection::all();
    for (attribute, qualifier) in qualifications {
        let value = match qualifier {
            Qualifier::Literal(value) => value.clone(),
            Qualifier::Arg(index) => call
                .args
                .get(*index)
                .cloned()
                .ok_or_else(|| DataError::Arity {
                    query: call.name.clone(),
                    expected: query.arity,
                    got: call.args.len(),
                })?,
        };
        selection = selection.where_eq(attribute.clone(), value);
    }
    Ok(Some(selection))
}

/// Whether `mutation` may change the results of `subscription`.
pub fn affects(
    container: &Container,
    tables: &Tables,
    subscription: &Subscription,
    mutation: &Mutation,
) -> Result<bool, DataError> {
    let root = container.finalized(&subscription.source)?;
    let Some(qualification) = qualification(root, subscription)? else {
        return Ok(false);
    };
    let qualifies = |row: &Values| qualification.matches(row, |a| root.attribute_type(a));

    if mutation.source == root.name() && mutation.candidate_rows().any(qualifies) {
        return Ok(true);
    }

    let mut paths = Vec::new();
    collect_paths(&subscription.includes, &mutation.source, &mut Vec::new(), &mut paths);

    let changed: Vec<Values> = mutation.candidate_rows().cloned().collect();
    for path in paths {
        let roots = walk_to_root(container, tables, root, &path, changed.clone())?;
        if roots.iter().any(qualifies) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Every include chain from the root ending at an include of `target`.
fn collect_paths<'a>(
    includes: &'a [Include],
    target: &str,
    prefix: &mut Vec<&'a Include>,
    paths: &mut Vec<Vec<&'a Include>>,
) {
    for include in includes {
        prefix.push(include);
        if include.target == target {
            paths.push(prefix.clone());
        }
        collect_paths(&include.includes, target, prefix, paths);
        prefix.pop();
    }
}

/// Follow `path` backwards from rows of its last source to the root rows
/// they belong to.
fn walk_to_root(
    container: &Container,
    tables: &Tables,
    root: &Source,
    path: &[&Include],
    mut rows: Vec<Values>,
) -> Result<Vec<Values>, DataError> {
    let mut parents: Vec<&Source> = vec![root];
    for include in path.iter().take(path.len().saturating_sub(1)) {
        parents.push(container.finalized(&include.target)?);
    }

    for (include, parent) in path.iter().zip(parents).rev() {
        if rows.is_empty() {
            break;
        }
        let association = parent.association(&include.association)?;
        let child = container.finalized(&association.target)?;
        rows = parent_rows(tables, parent, child, association, &rows);
    }
    Ok(rows)
}

/// Rows of `parent` related to `children` through `association`.
fn parent_rows(
    tables: &Tables,
    parent: &Source,
    child: &Source,
    association: &Association,
    children: &[Values],
) -> Vec<Values> {
    let selection = match association.kind {
        AssociationKind::HasMany => Selection::all().where_in(
            parent.key_column().to_owned(),
            column_values(children, &association.foreign_key),
        ),
        AssociationKind::BelongsTo => Selection::all().where_in(
            association.foreign_key.clone(),
            column_values(children, child.key_column()),
        ),
    };
    tables.select(parent, &selection)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use trellis_core::value::{FieldType, Value};
    use trellis_core::values;

    use super::*;
    use crate::command::MutationKind;
    use crate::definition::SourceDefinition;
    use crate::subscribers::{Delivery, SubscriptionHandler, Subscribers};

    struct Ignore;

    #[async_trait::async_trait]
    impl SubscriptionHandler for Ignore {
        async fn call(&self, _delivery: Delivery) -> anyhow::Result<()> {
            Ok(())
        }
    }

    async fn seeded() -> Container {
        let posts = SourceDefinition::new("posts")
            .primary_id()
            .attribute("title", FieldType::String)
            .has_many("comments")
            .query("drafts", 0, |_| Selection::all());
        let comments = SourceDefinition::new("comments")
            .primary_id()
            .attribute("body", FieldType::String)
            .has_many("likes");
        let likes = SourceDefinition::new("likes").primary_id();

        let subscribers = Arc::new(Subscribers::memory());
        subscribers.register_handler("test", Arc::new(Ignore));
        let container = Container::new([posts, comments, likes], subscribers).unwrap();
        let posts = container.source("posts").unwrap();
        posts.create(values! { "title" => "one" }).await.unwrap();
        posts.create(values! { "title" => "two" }).await.unwrap();
        let comments = container.source("comments").unwrap();
        comments.create(values! { "body" => "a", "post_id" => 1 }).await.unwrap();
        comments.create(values! { "body" => "b", "post_id" => 2 }).await.unwrap();
        container
    }

    async fn subscribed(container: &Container, query: Option<(&str, Value)>, includes: &[&str]) -> Subscription {
        let mut proxy = container.source("posts").unwrap();
        if let Some((name, arg)) = query {
            proxy = proxy.query(name, vec![arg]).unwrap();
        }
        match includes {
            [] => {}
            [first] => proxy = proxy.including(first).unwrap(),
            [first, second, ..] => {
                let second = (*second).to_owned();
                proxy = proxy
                    .including_with(first, move |nested| nested.including(&second))
                    .unwrap();
            }
        }
        let key = proxy.subscribe("s1", "test", Value::Null).await.unwrap();
        container
            .subscribers()
            .adapter()
            .subscription(&key)
            .await
            .unwrap()
            .unwrap()
    }

    fn mutation(source: &str, kind: MutationKind, row: Values) -> Mutation {
        let (pre, post) = match kind {
            MutationKind::Create => (Vec::new(), vec![row]),
            MutationKind::Update => (vec![row.clone()], vec![row]),
            MutationKind::Delete => (vec![row], Vec::new()),
        };
        Mutation {
            source: source.into(),
            kind,
            pre,
            post,
        }
    }

    async fn check(container: &Container, subscription: &Subscription, mutation: &Mutation) -> bool {
        let tables = container.store().read().await;
        affects(container, &tables, subscription, mutation).unwrap()
    }

    #[tokio::test]
    async fn direct_match_uses_qualified_arguments() {
        let container = seeded().await;
        let sub = subscribed(&container, Some(("by_id", Value::from(1))), &[]).await;

        let hit = mutation("posts", MutationKind::Update, values! { "id" => 1, "title" => "x" });
        let miss = mutation("posts", MutationKind::Update, values! { "id" => 2, "title" => "x" });
        assert!(check(&container, &sub, &hit).await);
        assert!(!check(&container, &sub, &miss).await);
    }

    #[tokio::test]
    async fn string_arguments_are_coerced() {
        let container = seeded().await;
        let sub = subscribed(&container, Some(("by_id", Value::from("1"))), &[]).await;
        let hit = mutation("posts", MutationKind::Delete, values! { "id" => 1 });
        assert!(check(&container, &sub, &hit).await);
    }

    #[tokio::test]
    async fn whole_source_matches_everything_and_unqualified_query_nothing() {
        let container = seeded().await;
        let all = subscribed(&container, None, &[]).await;
        let drafts = {
            let proxy = container.source("posts").unwrap().query("drafts", Vec::new()).unwrap();
            let key = proxy.subscribe("s1", "test", Value::Null).await.unwrap();
            container.subscribers().adapter().subscription(&key).await.unwrap().unwrap()
        };

        let change = mutation("posts", MutationKind::Create, values! { "id" => 9 });
        assert!(check(&container, &all, &change).await);
        assert!(!check(&container, &drafts, &change).await);
    }

    #[tokio::test]
    async fn one_unqualified_query_silences_a_chain() {
        let container = seeded().await;
        let proxy = container
            .source("posts")
            .unwrap()
            .query("by_id", vec![Value::from(1)])
            .unwrap()
            .query("drafts", Vec::new())
            .unwrap();
        let key = proxy.subscribe("s1", "test", Value::Null).await.unwrap();
        let sub = container.subscribers().adapter().subscription(&key).await.unwrap().unwrap();

        let change = mutation("posts", MutationKind::Update, values! { "id" => 1, "title" => "x" });
        assert!(!check(&container, &sub, &change).await);
    }

    #[tokio::test]
    async fn association_changes_walk_back_to_the_root() {
        let container = seeded().await;
        let sub = subscribed(&container, Some(("by_id", Value::from(1))), &["comments"]).await;

        let on_one = mutation("comments", MutationKind::Create, values! { "id" => 3, "post_id" => 1 });
        let on_two = mutation("comments", MutationKind::Create, values! { "id" => 4, "post_id" => 2 });
        assert!(check(&container, &sub, &on_one).await);
        assert!(!check(&container, &sub, &on_two).await);
    }

    #[tokio::test]
    async fn deep_includes_resolve_intermediate_rows() {
        let container = seeded().await;
        let sub = subscribed(&container, Some(("by_id", Value::from(1))), &["comments", "likes"]).await;

        let like_on_one = mutation("likes", MutationKind::Create, values! { "id" => 1, "comment_id" => 1 });
        let like_on_two = mutation("likes", MutationKind::Create, values! { "id" => 2, "comment_id" => 2 });
        assert!(check(&container, &sub, &like_on_one).await);
        assert!(!check(&container, &sub, &like_on_two).await);
    }

    #[tokio::test]
    async fn unrelated_sources_never_match() {
        let container = seeded().await;
        let sub = subscribed(&container, None, &[]).await;
        let change = mutation("likes", MutationKind::Create, values! { "id" => 1 });
        assert!(!check(&container, &sub, &change).await);
    }
}

//! Name-based access to every source of an environment.

use std::sync::Arc;

use crate::container::Container;
use crate::definition::SourceDefinition;
use crate::error::{DataError, LookupError};
use crate::proxy::Proxy;
use crate::subscribers::Subscribers;

/// Finds sources across containers.
#[derive(Debug, Clone)]
pub struct Lookup {
    containers: Vec<Container>,
    subscribers: Arc<Subscribers>,
}

impl Lookup {
    /// A lookup over `containers`, which must all report to `subscribers`.
    pub fn new(containers: Vec<Container>, subscribers: Arc<Subscribers>) -> Self {
        Self {
            containers,
            subscribers,
        }
    }

    /// A lookup over one container built from `definitions`.
    pub fn with_definitions(
        definitions: impl IntoIterator<Item = SourceDefinition>,
        subscribers: Arc<Subscribers>,
    ) -> Result<Self, DataError> {
        let container = Container::new(definitions, Arc::clone(&subscribers))?;
        Ok(Self::new(vec![container], subscribers))
    }

    /// A proxy over the source called `name`.
    pub fn source(&self, name: &str) -> Result<Proxy, DataError> {
        self.container_for(name)?.source(name)
    }

    /// The container holding `name`.
    pub fn container_for(&self, name: &str) -> Result<&Container, LookupError> {
        self.containers
            .iter()
            .find(|container| container.contains(name))
            .ok_or_else(|| LookupError::Source(name.to_owned()))
    }

    /// The subscription engine.
    pub const fn subscribers(&self) -> &Arc<Subscribers> {
        &self.subscribers
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use trellis_core::value::FieldType;

    use super::*;

    #[test]
    fn finds_sources_across_containers() {
        let subscribers = Arc::new(Subscribers::memory());
        let a = Container::new(
            [SourceDefinition::new("posts").primary_id()],
            Arc::clone(&subscribers),
        )
        .unwrap();
        let b = Container::new(
            [SourceDefinition::new("users").attribute("name", FieldType::String)],
            Arc::clone(&subscribers),
        )
        .unwrap();
        let lookup = Lookup::new(vec![a, b], subscribers);

        assert_eq!(lookup.source("users").unwrap().source().name(), "users");
        assert!(matches!(
            lookup.source("widgets").unwrap_err(),
            DataError::Lookup(LookupError::Source(name)) if name == "widgets"
        ));
    }
}

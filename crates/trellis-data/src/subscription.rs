//! Subscriptions and their content-derived keys.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use trellis_core::value::Value;

use crate::error::DataError;

/// A named query applied to a proxy, with its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryCall {
    /// Query name.
    pub name: String,
    /// Query arguments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,
}

impl QueryCall {
    /// A call of `name` with `args`.
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

/// An association included into query results, with its own narrowing
/// queries and nested includes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Include {
    /// Association name on the parent source.
    pub association: String,
    /// Target source name.
    pub target: String,
    /// Queries narrowing the included rows, in the order applied.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub queries: Vec<QueryCall>,
    /// Includes of the included rows.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub includes: Vec<Include>,
}

/// Identifies a subscription: the hex SHA-256 digest of its JSON form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionKey(String);

impl SubscriptionKey {
    /// Wrap an existing key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A subscriber's interest in the results of one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    /// Who is subscribed (a socket id, for realtime subscriptions).
    pub subscriber: String,
    /// Root source.
    pub source: String,
    /// Every query applied, in order. Empty subscribes to the source as a
    /// whole.
    pub queries: Vec<QueryCall>,
    /// Included associations.
    pub includes: Vec<Include>,
    /// Name of the handler results are delivered to.
    pub handler: String,
    /// Handler-specific data, passed back on every delivery.
    pub payload: Value,
}

impl Subscription {
    /// The key of this subscription. Equal subscriptions have equal keys.
    pub fn key(&self) -> Result<SubscriptionKey, DataError> {
        let json = serde_json::to_vec(self)?;
        Ok(SubscriptionKey(hex::encode(Sha256::digest(&json))))
    }

    /// The root source and every included source.
    pub fn sources(&self) -> BTreeSet<&str> {
        let mut sources = BTreeSet::from([self.source.as_str()]);
        let mut pending: Vec<&Include> = self.includes.iter().collect();
        while let Some(include) = pending.pop() {
            sources.insert(include.target.as_str());
            pending.extend(&include.includes);
        }
        sources
    }
}

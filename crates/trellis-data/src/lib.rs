//! Sources, queries, commands and the data subscription engine.
//!
//! Sources are declared with [`SourceDefinition`] and finalized into a
//! [`Container`]. Queries run through [`Proxy`]; commands change rows and
//! report every [`Mutation`](command::Mutation) to [`Subscribers`], which
//! re-runs the queries whose results may have changed and delivers them to
//! named [`SubscriptionHandler`]s.
//!
//! ```
//! # async fn demo() -> Result<(), trellis_data::DataError> {
//! use std::sync::Arc;
//!
//! use trellis_core::value::FieldType;
//! use trellis_core::values;
//! use trellis_data::{Lookup, SourceDefinition, Subscribers};
//!
//! let posts = SourceDefinition::new("posts")
//!     .primary_id()
//!     .attribute("title", FieldType::String);
//! let lookup = Lookup::with_definitions([posts], Arc::new(Subscribers::memory()))?;
//!
//! lookup.source("posts")?.create(values! { "title" => "hello" }).await?;
//! assert_eq!(lookup.source("posts")?.count().await?, 1);
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod command;
pub mod container;
pub mod definition;
pub mod error;
pub mod executor;
pub mod lookup;
pub mod proxy;
pub mod qualification;
pub mod selection;
pub mod source;
pub mod store;
pub mod subscribers;
pub mod subscription;

pub use container::Container;
pub use definition::{Qualifier, SourceDefinition};
pub use error::{DataError, LookupError};
pub use lookup::Lookup;
pub use proxy::Proxy;
pub use selection::Selection;
pub use subscribers::{Delivery, SubscriptionHandler, Subscribers};
pub use subscription::{Include, QueryCall, Subscription, SubscriptionKey};

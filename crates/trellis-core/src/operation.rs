//! Operations: verified, haltable units of business logic.
//!
//! An [`Operation`] is a pipeline over an [`OperationState`] holding the
//! input values. A verify step sanitizes and coerces the values before the
//! remaining actions see them and halts the operation when verification
//! fails. Errors raised by actions can be handled per error type.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::pipeline::{Action, Flow, Pipeline, PipelineBuilder, PipelineObject, PipelineState};
use crate::value::Values;
use crate::verifier::{Verification, Verifier};

/// The object an operation's actions work on.
#[derive(Debug, Clone, Default)]
pub struct OperationState {
    state: PipelineState,
    /// Input values; replaced by the sanitized values after verification.
    pub values: Values,
    /// The verification result, once the verify step has run.
    pub verification: Option<Verification>,
}

impl OperationState {
    /// State for `values`.
    pub fn new(values: Values) -> Self {
        Self {
            values,
            ..Self::default()
        }
    }

    /// False only when verification ran and failed.
    pub fn is_verified(&self) -> bool {
        self.verification.as_ref().is_none_or(Verification::is_verified)
    }
}

impl PipelineObject for OperationState {
    fn pipeline_state(&self) -> &PipelineState {
        &self.state
    }

    fn pipeline_state_mut(&mut self) -> &mut PipelineState {
        &mut self.state
    }
}

struct Verify(Verifier);

#[async_trait]
impl Action<OperationState> for Verify {
    async fn call(&self, state: &mut OperationState) -> anyhow::Result<Flow> {
        let verification = self.0.call(&state.values);
        state.values = verification.values().clone();
        let verified = verification.is_verified();
        state.verification = Some(verification);

        if verified {
            Ok(Flow::Continue)
        } else {
            Ok(state.halt())
        }
    }

    fn name(&self) -> &str {
        "verify"
    }
}

type Handler = Arc<dyn Fn(&anyhow::Error, &mut OperationState) -> Option<anyhow::Result<()>> + Send + Sync>;

/// A built operation.
#[derive(Clone)]
pub struct Operation {
    name: String,
    pipeline: Pipeline<OperationState>,
    handlers: Vec<Handler>,
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.name)
            .field("pipeline", &self.pipeline)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl Operation {
    /// Start building an operation.
    pub fn builder(name: impl Into<String>) -> OperationBuilder {
        OperationBuilder {
            name: name.into(),
            pipeline: PipelineBuilder::new(),
            handlers: Vec::new(),
        }
    }

    /// The operation name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the operation on `values`.
    ///
    /// When an action fails, the first registered handler that accepts the
    /// error handles it and the state is returned as it stands.
    ///
    /// # Errors
    ///
    /// Returns the action error when no handler accepts it, or the error a
    /// handler itself raises.
    pub async fn perform(&self, values: Values) -> anyhow::Result<OperationState> {
        let mut state = OperationState::new(values);

        let Err(error) = self.pipeline.call(&mut state).await else {
            return Ok(state);
        };

        for handler in &self.handlers {
            if let Some(handled) = handler(&error, &mut state) {
                handled?;
                return Ok(state);
            }
        }

        tracing::debug!(operation = %self.name, error = %error, "operation failed");
        Err(error)
    }
}

/// Collects the steps of an [`Operation`].
pub struct OperationBuilder {
    name: String,
    pipeline: PipelineBuilder<OperationState>,
    handlers: Vec<Handler>,
}

impl fmt::Debug for OperationBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationBuilder")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl OperationBuilder {
    /// Verify the values with `verifier` at this point in the pipeline.
    #[must_use]
    pub fn verify(self, verifier: Verifier) -> Self {
        self.action(Verify(verifier))
    }

    /// Add an action.
    #[must_use]
    pub fn action(mut self, action: impl Action<OperationState> + 'static) -> Self {
        self.pipeline = self.pipeline.action(action);
        self
    }

    /// Handle errors of type `E`.
    #[must_use]
    pub fn handle<E, F>(mut self, handler: F) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
        F: Fn(&E, &mut OperationState) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers
            .push(Arc::new(move |error: &anyhow::Error, state: &mut OperationState| {
                error.downcast_ref::<E>().map(|e| handler(e, state))
            }));
        self
    }

    /// Handle any error not handled by an earlier handler.
    #[must_use]
    pub fn handle_any<F>(mut self, handler: F) -> Self
    where
        F: Fn(&anyhow::Error, &mut OperationState) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers
            .push(Arc::new(move |error: &anyhow::Error, state: &mut OperationState| {
                Some(handler(error, state))
            }));
        self
    }

    /// Freeze the operation.
    pub fn build(self) -> Operation {
        Operation {
            name: self.name,
            pipeline: self.pipeline.build(),
            handlers: self.handlers,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::pipeline::action_fn;
    use crate::value::{FieldType, Value};
    use crate::values;
    use crate::verifier::Field;

    #[derive(Debug, thiserror::Error)]
    #[error("out of stock")]
    struct OutOfStock;

    fn order() -> OperationBuilder {
        Operation::builder("order").verify(
            Verifier::new()
                .field(Field::required("sku"))
                .field(Field::required("quantity").typed(FieldType::Integer)),
        )
    }

    #[tokio::test]
    async fn verified_values_reach_later_actions() {
        let op = order()
            .action(action_fn(|state: &mut OperationState| {
                let qty = state.values["quantity"].as_i64().unwrap_or_default();
                state.values.insert("total".into(), Value::Integer(qty * 10));
                Ok(Flow::Continue)
            }))
            .build();

        let state = op
            .perform(values! { "sku" => "a1", "quantity" => "2", "junk" => true })
            .await
            .unwrap();
        assert!(state.is_verified());
        assert_eq!(state.values.get("total"), Some(&Value::Integer(20)));
        assert!(!state.values.contains_key("junk"));
    }

    #[tokio::test]
    async fn failed_verification_halts() {
        let op = order()
            .action(action_fn(|_: &mut OperationState| Err(anyhow::anyhow!("must not run"))))
            .build();

        let state = op.perform(values! { "sku" => "a1" }).await.unwrap();
        assert!(state.is_halted());
        assert!(!state.is_verified());
        let messages = state.verification.unwrap().messages().clone();
        assert!(messages.contains_key("quantity"));
    }

    #[tokio::test]
    async fn typed_handler_wins_for_its_error() {
        let op = order()
            .action(action_fn(|_: &mut OperationState| Err(OutOfStock.into())))
            .handle::<OutOfStock, _>(|_, state| {
                state.values.insert("handled".into(), "stock".into());
                Ok(())
            })
            .handle_any(|_, state| {
                state.values.insert("handled".into(), "any".into());
                Ok(())
            })
            .build();

        let state = op
            .perform(values! { "sku" => "a1", "quantity" => 1 })
            .await
            .unwrap();
        assert_eq!(state.values["handled"], Value::from("stock"));
    }

    #[tokio::test]
    async fn unhandled_errors_propagate() {
        let op = order()
            .action(action_fn(|_: &mut OperationState| Err(anyhow::anyhow!("boom"))))
            .handle::<OutOfStock, _>(|_, _| Ok(()))
            .build();

        let error = op
            .perform(values! { "sku" => "a1", "quantity" => 1 })
            .await
            .unwrap_err();
        assert_eq!(error.to_string(), "boom");
    }
}

//! Ordered, haltable action chains.
//!
//! A [`Pipeline`] runs its [`Action`]s in registration order against a
//! mutable [`PipelineObject`]. Actions steer the chain by returning a
//! [`Flow`]:
//!
//! - [`Flow::Continue`] -- move on to the next action
//! - [`Flow::Halt`] -- stop this pipeline; the object stays halted
//! - [`Flow::Reject`] -- decline the object; the caller one level up
//!   decides who gets it next
//!
//! Errors are never rescued here. They propagate out of
//! [`Pipeline::call`] for the caller to convert into a response.
//!
//! Pipelines are built once through [`PipelineBuilder`] and are immutable
//! afterwards. A pipeline is itself an action, so pipelines nest; each
//! nested pipeline is its own reject boundary.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

/// Control signal returned by every action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep going.
    Continue,
    /// Stop executing actions for this object in the current pipeline.
    Halt,
    /// Decline the object; control passes to the next candidate owner.
    Reject,
}

/// How a pipeline run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every action ran without halting or rejecting.
    Completed,
    /// An action halted the object.
    Halted,
    /// An action rejected the object.
    Rejected,
}

/// Halt/reject bookkeeping carried by every pipeline object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineState {
    halted: bool,
    rejected: bool,
    pipelined: bool,
}

impl PipelineState {
    /// Forget a previous rejection so the object can be offered to the next
    /// owner.
    pub const fn clear_rejected(&mut self) {
        self.rejected = false;
    }
}

/// Capability that makes an object passable through a [`Pipeline`].
pub trait PipelineObject: Send + 'static {
    /// Borrow the pipeline bookkeeping.
    fn pipeline_state(&self) -> &PipelineState;

    /// Mutably borrow the pipeline bookkeeping.
    fn pipeline_state_mut(&mut self) -> &mut PipelineState;

    /// Mark the object halted. Return the result from an action:
    /// `return Ok(connection.halt());`
    fn halt(&mut self) -> Flow {
        self.pipeline_state_mut().halted = true;
        Flow::Halt
    }

    /// Mark the object rejected by the current owner.
    fn reject(&mut self) -> Flow {
        self.pipeline_state_mut().rejected = true;
        Flow::Reject
    }

    /// Whether the object has been halted.
    fn is_halted(&self) -> bool {
        self.pipeline_state().halted
    }

    /// Whether the current owner rejected the object.
    fn is_rejected(&self) -> bool {
        self.pipeline_state().rejected
    }

    /// Record that the object has entered a pipeline.
    fn mark_pipelined(&mut self) {
        self.pipeline_state_mut().pipelined = true;
    }

    /// Whether the object has entered a pipeline.
    fn is_pipelined(&self) -> bool {
        self.pipeline_state().pipelined
    }
}

/// A unit of pipeline work.
#[async_trait]
pub trait Action<T: PipelineObject>: Send + Sync {
    /// Run the action against `object`.
    ///
    /// # Errors
    ///
    /// Any error is propagated out of the pipeline untouched.
    async fn call(&self, object: &mut T) -> anyhow::Result<Flow>;

    /// Name used when logging the pipeline layout.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// An [`Action`] backed by a synchronous closure.
pub struct FnAction<F> {
    name: String,
    f: F,
}

impl<F> fmt::Debug for FnAction<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnAction").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Wrap a closure as an action.
///
/// ```
/// use trellis_core::pipeline::{action_fn, Flow};
/// use trellis_core::connection::Connection;
///
/// let mark = action_fn(|conn: &mut Connection| {
///     conn.set_header("x-seen", "1")?;
///     Ok(Flow::Continue)
/// });
/// # let _ = mark;
/// ```
pub fn action_fn<T, F>(f: F) -> FnAction<F>
where
    T: PipelineObject,
    F: Fn(&mut T) -> anyhow::Result<Flow> + Send + Sync,
{
    FnAction {
        name: String::from("closure"),
        f,
    }
}

impl<F> FnAction<F> {
    /// Give the closure action a name for logs.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl<T, F> Action<T> for FnAction<F>
where
    T: PipelineObject,
    F: Fn(&mut T) -> anyhow::Result<Flow> + Send + Sync,
{
    async fn call(&self, object: &mut T) -> anyhow::Result<Flow> {
        (self.f)(object)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Coarse ordering group for actions registered by different behaviours.
///
/// Within a stage, actions keep their registration order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    /// Framework actions that must see the request first (upgrades).
    Early,
    /// User actions and controllers.
    #[default]
    Routes,
    /// Fallbacks that only run when nothing else halted.
    Late,
}

/// Collects actions before freezing them into a [`Pipeline`].
pub struct PipelineBuilder<T: PipelineObject> {
    entries: Vec<(Stage, Arc<dyn Action<T>>)>,
}

impl<T: PipelineObject> Default for PipelineBuilder<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T: PipelineObject> fmt::Debug for PipelineBuilder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(stage, action)| (stage, action.name())))
            .finish()
    }
}

impl<T: PipelineObject> PipelineBuilder<T> {
    /// Start an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an action to the default stage.
    #[must_use]
    pub fn action(mut self, action: impl Action<T> + 'static) -> Self {
        self.push(Stage::default(), Arc::new(action));
        self
    }

    /// Append an already shared action to `stage`.
    pub fn push(&mut self, stage: Stage, action: Arc<dyn Action<T>>) {
        self.entries.push((stage, action));
    }

    /// Number of actions registered so far.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no actions are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Freeze the builder. Actions are ordered by stage, then by
    /// registration order.
    pub fn build(mut self) -> Pipeline<T> {
        self.entries.sort_by_key(|(stage, _)| *stage);
        Pipeline {
            actions: self.entries.into_iter().map(|(_, action)| action).collect(),
        }
    }
}

/// An immutable, ordered chain of actions.
pub struct Pipeline<T: PipelineObject> {
    actions: Arc<[Arc<dyn Action<T>>]>,
}

impl<T: PipelineObject> Clone for Pipeline<T> {
    fn clone(&self) -> Self {
        Self {
            actions: Arc::clone(&self.actions),
        }
    }
}

impl<T: PipelineObject> Default for Pipeline<T> {
    fn default() -> Self {
        PipelineBuilder::new().build()
    }
}

impl<T: PipelineObject> fmt::Debug for Pipeline<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline").field("actions", &self.names()).finish()
    }
}

impl<T: PipelineObject> Pipeline<T> {
    /// Start building a pipeline.
    pub fn builder() -> PipelineBuilder<T> {
        PipelineBuilder::new()
    }

    /// Number of actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether the pipeline has no actions.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Action names in execution order.
    pub fn names(&self) -> Vec<&str> {
        self.actions.iter().map(|action| action.name()).collect()
    }

    /// Run every action against `object` in order.
    ///
    /// Stops early when an action halts or rejects. An object that arrives
    /// already halted runs nothing.
    ///
    /// # Errors
    ///
    /// Propagates the first error raised by an action.
    pub async fn call(&self, object: &mut T) -> anyhow::Result<Outcome> {
        object.mark_pipelined();

        for action in self.actions.iter() {
            if object.is_halted() {
                return Ok(Outcome::Halted);
            }

            match action.call(object).await? {
                Flow::Continue => {
                    if object.is_rejected() {
                        return Ok(Outcome::Rejected);
                    }
                }
                Flow::Halt => {
                    object.pipeline_state_mut().halted = true;
                    return Ok(Outcome::Halted);
                }
                Flow::Reject => {
                    object.pipeline_state_mut().rejected = true;
                    return Ok(Outcome::Rejected);
                }
            }
        }

        if object.is_halted() {
            Ok(Outcome::Halted)
        } else {
            Ok(Outcome::Completed)
        }
    }
}

#[async_trait]
impl<T: PipelineObject> Action<T> for Pipeline<T> {
    async fn call(&self, object: &mut T) -> anyhow::Result<Flow> {
        match Self::call(self, object).await? {
            Outcome::Completed => Ok(Flow::Continue),
            Outcome::Halted => Ok(Flow::Halt),
            Outcome::Rejected => {
                object.pipeline_state_mut().clear_rejected();
                Ok(Flow::Continue)
            }
        }
    }

    fn name(&self) -> &str {
        "pipeline"
    }
}

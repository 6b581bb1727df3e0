//! The command contract: the factory that seeds a queue and builds tasks
//! from persisted specs when a run resumes or a requeue reconstructs work.

use async_trait::async_trait;

use crate::state::TaskSpec;
use crate::task::{Task, TaskContext};

/// A command bundles together everything needed to start and resume a run:
/// the initial batch of tasks, and a way to rebuild a `Task` from a
/// `TaskSpec` read back out of `state.json`.
#[async_trait]
pub trait Command: Send + Sync {
    /// Produces the queue's initial set of tasks. Called once, before the
    /// first task is dispatched.
    async fn create_new_queue_items(&self, ctx: &TaskContext) -> anyhow::Result<Vec<Box<dyn Task>>>;

    /// Reconstructs a task from a spec pulled out of `unresolved` (on resume)
    /// or `errored`/a requeue promotion. Must be pure and infallible with
    /// respect to the spec's shape — specs this command itself produced are
    /// always valid input.
    fn create_task(&self, spec: TaskSpec) -> Box<dyn Task>;
}

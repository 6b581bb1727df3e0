//! The requeue operation: reopens a completed run directory and
//! mass-promotes failures back into `unresolved`.

use clap::ValueEnum;

use crate::state::{new_task_id, ProcessState};
use crate::store::{ProcessFileStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum RequeueType {
    Errored,
    NonCriticalErrored,
}

/// Promotes every matching failure into a fresh `unresolved` entry, then
/// clears completion so the directory resumes on the next `execute`.
pub fn requeue(store: &ProcessFileStore, dir_name: &str, requeue_type: RequeueType) -> Result<usize, StoreError> {
    let mut state = store.read_state(dir_name)?;
    let promoted = match requeue_type {
        RequeueType::Errored => requeue_errored(&mut state),
        RequeueType::NonCriticalErrored => requeue_non_critical_errored(&mut state),
    };
    state.completion_date = None;
    state.completion_error = None;
    store.write_state(dir_name, &state)?;
    Ok(promoted)
}

fn requeue_errored(state: &mut ProcessState) -> usize {
    let ids: Vec<String> = state.buckets.errored.keys().cloned().collect();
    for id in &ids {
        let mut spec = state.buckets.errored[id].spec.clone();
        spec.id = new_task_id();
        spec.originating_task_id = Some(id.clone());
        state.buckets.unresolved.insert(spec.id.clone(), spec);
    }
    ids.len()
}

fn requeue_non_critical_errored(state: &mut ProcessState) -> usize {
    let ids: Vec<String> = state
        .buckets
        .resolved
        .iter()
        .filter(|(_, entry)| entry.non_critical_error.is_some())
        .map(|(id, _)| id.clone())
        .collect();
    for id in &ids {
        let mut spec = state.buckets.resolved[id].spec.clone();
        spec.id = new_task_id();
        spec.originating_task_id = Some(id.clone());
        state.buckets.unresolved.insert(spec.id.clone(), spec);
    }
    ids.len()
}

//! Rule task reconciliation against the available workers.

use pvr_protocol::{RecordingRule, Task, WorkerInfo};

/// Rebuild a rule's task list for the given workers.
///
/// Returns `None` when the rule already matches. Otherwise tasks follow
/// the worker order; a task whose worker still exists keeps its enabled
/// flag and settings, a new worker gets a disabled default task and
/// tasks of vanished workers are dropped.
pub fn reconcile_tasks(rule: &RecordingRule, workers: &[WorkerInfo]) -> Option<Vec<Task>> {
    let matches = rule.tasks.len() == workers.len()
        && rule
            .tasks
            .iter()
            .zip(workers)
            .all(|(task, worker)| task.name == worker.name && task.title == worker.title);
    if matches {
        return None;
    }

    let tasks = workers
        .iter()
        .map(|worker| match rule.tasks.iter().find(|t| t.name == worker.name) {
            Some(existing) => Task {
                title: worker.title.clone(),
                ..existing.clone()
            },
            None => Task::with_defaults(worker.name.clone(), worker.title.clone()),
        })
        .collect();
    Some(tasks)
}

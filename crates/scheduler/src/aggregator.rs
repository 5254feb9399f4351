//! Job status aggregation and the task timeout sweep.

use futures::future::join_all;
use serde_json::json;
use tracing::{debug, info, warn};

use common::registry::fields;
use common::{
    split_doc_path, Filter, JobStatus, Registry, RegistryError, TaskDoc, TaskStatus, JOB_TASKS, TASK_TIMEOUT_ERROR,
};

/// Completion flag and status of a job given all of its tasks.
/// A job with no visible tasks is still in progress.
pub fn aggregate(tasks: &[TaskDoc]) -> (bool, JobStatus) {
    if tasks.is_empty() {
        return (false, JobStatus::Inprogress);
    }
    let finished = tasks.iter().filter(|t| t.completed).count();
    let completed = finished == tasks.len();
    if !completed {
        return (false, JobStatus::Inprogress);
    }
    let status = if tasks.iter().any(TaskDoc::has_test_failure) {
        JobStatus::Failure
    } else if tasks.iter().any(|t| t.status == TaskStatus::Error) {
        JobStatus::Unstable
    } else {
        JobStatus::Success
    };
    (true, status)
}

/// Recompute the owning job from every one of its tasks.
///
/// Returns the written status, or `None` when the updated task is still pending.
pub async fn on_task_update(registry: &dyn Registry, task: &TaskDoc) -> Result<Option<JobStatus>, RegistryError> {
    if task.status == TaskStatus::Pending {
        debug!(job=%task.job, "task pending, skip job update");
        return Ok(None);
    }
    let (collection, job_id) =
        split_doc_path(&task.job).ok_or_else(|| RegistryError::InvalidPath(task.job.clone()))?;

    let docs = registry.query(JOB_TASKS, &[Filter::eq("job", task.job.as_str())]).await?;
    let tasks = docs.iter().map(|d| d.decode::<TaskDoc>()).collect::<Result<Vec<_>, _>>()?;
    let (completed, status) = aggregate(&tasks);
    info!(
        job=%job_id,
        finished=tasks.iter().filter(|t| t.completed).count(),
        total=tasks.len(),
        status=%status,
        "job progress"
    );

    registry
        .set(collection, job_id, fields(json!({"completed": completed, "status": status})), true)
        .await?;
    Ok(Some(status))
}

/// Mark every incomplete task whose deadline is before `now` (unix millis) as
/// failed. Returns the number of tasks reclaimed; a failed write is logged
/// and does not stop the others.
pub async fn check_task_timeout(registry: &dyn Registry, now: u64) -> Result<usize, RegistryError> {
    let overdue = registry
        .query(JOB_TASKS, &[Filter::eq("completed", false), Filter::lt("timeout", now)])
        .await?;
    let update = fields(json!({
        "status": TaskStatus::Error,
        "error": TASK_TIMEOUT_ERROR,
        "completed": true,
    }));
    let writes = join_all(overdue.iter().map(|doc| registry.set(JOB_TASKS, &doc.id, update.clone(), true))).await;
    let mut reclaimed = 0;
    for (doc, res) in overdue.iter().zip(writes) {
        match res {
            Ok(()) => reclaimed += 1,
            Err(e) => warn!(task=%doc.id, error=%e, "failed to reclaim timed out task"),
        }
    }
    if reclaimed > 0 {
        info!(count = reclaimed, "reclaimed timed out tasks");
    }
    Ok(reclaimed)
}

//! Turns a job request into one job document and its tasks.

use std::collections::HashSet;
use std::time::Duration;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use common::registry::to_fields;
use common::{
    doc_path, now_millis, split_doc_path, Document, Filter, JobDoc, JobStatus, Registry, TaskDoc, TaskStatus,
    DEVICES, DEVICE_GROUPS, JOBS, JOB_TASKS,
};

use crate::error::JobError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    /// Reference to a debug build artifact, e.g. `applications/a/versions/v/artifacts/x`.
    pub artifact: String,
    #[serde(default)]
    pub devices: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    /// Number of tasks to create; zero means one per candidate device.
    #[serde(default)]
    pub devices_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreatedJob {
    pub job_id: String,
    pub task_ids: Vec<String>,
}

/// Validate the artifact pair, resolve candidate devices and write the job
/// followed by its tasks.
///
/// Creation is not transactional: a failure while adding tasks leaves the
/// job document behind.
pub async fn create_job(
    registry: &dyn Registry,
    request: &JobRequest,
    task_timeout: Duration,
) -> Result<CreatedJob, JobError> {
    let (collection, artifact_id) = split_doc_path(&request.artifact).ok_or(JobError::NotDebugArtifact)?;
    let artifact = registry
        .get(collection, artifact_id)
        .await?
        .filter(|doc| doc.fields.get("type").and_then(|t| t.as_str()) == Some("debug"))
        .ok_or(JobError::NotDebugArtifact)?;

    let test_artifact = find_test_artifact(registry, collection, &artifact).await?;

    let devices = candidate_devices(registry, request).await?;
    if devices.is_empty() {
        return Err(JobError::NoDeviceFound);
    }
    let task_count = match request.devices_count {
        0 => devices.len(),
        n => n.min(devices.len()),
    };

    let job = JobDoc {
        apk: doc_path(collection, &artifact.id),
        apk_test: doc_path(collection, &test_artifact.id),
        completed: false,
        status: JobStatus::Pending,
    };
    let job_id = registry.add(JOBS, to_fields(&job)?).await?;

    let task = TaskDoc {
        job: doc_path(JOBS, &job_id),
        devices,
        status: TaskStatus::Pending,
        completed: false,
        timeout: Some(now_millis() + task_timeout.as_millis() as u64),
        result: None,
        error: None,
    };
    let fields = to_fields(&task)?;
    let task_ids = try_join_all((0..task_count).map(|_| registry.add(JOB_TASKS, fields.clone()))).await?;

    info!(job=%job_id, tasks=task_ids.len(), devices=task.devices.len(), "job created");
    Ok(CreatedJob { job_id, task_ids })
}

/// First `test` artifact in the same collection with the debug artifact's
/// build type and flavor.
async fn find_test_artifact(
    registry: &dyn Registry,
    collection: &str,
    artifact: &Document,
) -> Result<Document, JobError> {
    let same = |doc: &Document, field: &str| doc.fields.get(field) == artifact.fields.get(field);
    registry
        .query(collection, &[Filter::eq("type", "test")])
        .await?
        .into_iter()
        .find(|doc| same(doc, "buildType") && same(doc, "flavor"))
        .ok_or(JobError::TestArtifactNotFound)
}

/// Group members then explicit ids, deduplicated in first-seen order and
/// limited to devices that exist. With nothing requested, every device.
async fn candidate_devices(registry: &dyn Registry, request: &JobRequest) -> Result<Vec<String>, JobError> {
    let group_paths: Vec<String> = request
        .groups
        .iter()
        .map(|g| format!("{DEVICE_GROUPS}/{g}/{DEVICES}"))
        .collect();
    let members = try_join_all(group_paths.iter().map(|path| registry.query(path, &[]))).await?;

    let mut seen = HashSet::new();
    let requested: Vec<String> = members
        .into_iter()
        .flatten()
        .map(|doc| doc.id)
        .chain(request.devices.iter().cloned())
        .filter(|id| seen.insert(id.clone()))
        .collect();

    if requested.is_empty() {
        let all = registry.query(DEVICES, &[]).await?;
        return Ok(all.into_iter().map(|doc| doc.id).collect());
    }

    let found = try_join_all(requested.iter().map(|id| registry.get(DEVICES, id))).await?;
    let existing: Vec<String> = requested
        .into_iter()
        .zip(found)
        .filter_map(|(id, doc)| doc.map(|_| id))
        .collect();
    debug!(devices=?existing, "resolved candidate devices");
    Ok(existing)
}

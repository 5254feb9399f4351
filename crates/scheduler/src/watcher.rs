use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use common::{Document, Fields, Registry, RegistryError, TaskDoc, TaskStatus, JOB_TASKS};

use crate::aggregator::on_task_update;

const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Re-aggregates jobs whenever one of their tasks changes.
///
/// A job whose update fails stays queued, keyed by job reference, and is
/// retried on the next snapshot or retry tick.
pub struct TaskWatcher {
    registry: Arc<dyn Registry>,
    seen: HashMap<String, Fields>,
    retry: BTreeMap<String, TaskDoc>,
    retry_every: Duration,
}

impl TaskWatcher {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry,
            seen: HashMap::new(),
            retry: BTreeMap::new(),
            retry_every: DEFAULT_RETRY_INTERVAL,
        }
    }

    pub fn with_retry_interval(mut self, every: Duration) -> Self {
        self.retry_every = every;
        self
    }

    /// Follow `jobs-tasks` until the subscription ends. The first result set
    /// counts as a change, so jobs finished while nobody was watching catch up.
    pub async fn run(mut self) -> Result<(), RegistryError> {
        let mut snapshots = self.registry.listen(JOB_TASKS, &[]).await?;
        let mut tick = tokio::time::interval(self.retry_every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("watching task updates");
        loop {
            tokio::select! {
                snapshot = snapshots.next() => {
                    let Some(snapshot) = snapshot else { break };
                    match snapshot {
                        Ok(docs) => {
                            for task in self.changed(docs) {
                                self.retry.insert(task.job.clone(), task);
                            }
                        }
                        Err(e) => warn!(error=%e, "task subscription error"),
                    }
                    self.flush().await;
                }
                _ = tick.tick(), if !self.retry.is_empty() => self.flush().await,
            }
        }
        Ok(())
    }

    /// Update every queued job; failures stay queued.
    async fn flush(&mut self) {
        let queued = std::mem::take(&mut self.retry);
        for (job, task) in queued {
            if let Err(e) = on_task_update(self.registry.as_ref(), &task).await {
                warn!(job=%job, error=%e, "job update failed, will retry");
                self.retry.entry(job).or_insert(task);
            }
        }
    }

    /// Non-pending tasks whose document differs from the previous result set,
    /// one per job.
    fn changed(&mut self, docs: Vec<Document>) -> Vec<TaskDoc> {
        let mut by_job = BTreeMap::new();
        let mut current = HashMap::with_capacity(docs.len());
        for doc in docs {
            if self.seen.get(&doc.id) != Some(&doc.fields) {
                match doc.decode::<TaskDoc>() {
                    Ok(task) if task.status != TaskStatus::Pending => {
                        by_job.entry(task.job.clone()).or_insert(task);
                    }
                    Ok(_) => {}
                    Err(e) => warn!(task=%doc.id, error=%e, "skipping undecodable task"),
                }
            }
            current.insert(doc.id, doc.fields);
        }
        self.seen = current;
        by_job.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use common::registry::{fields, MemoryRegistry};
    use common::{JobDoc, JobStatus, JOBS};
    use serde_json::json;

    use crate::scheduler::tests::{seed_artifacts, seed_devices, ARTIFACTS};
    use crate::scheduler::{create_job, JobRequest};
    use crate::testing::FailingRegistry;

    async fn wait_completed(reg: &MemoryRegistry, job_id: &str) -> JobDoc {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let job: JobDoc = reg.get(JOBS, job_id).await.unwrap().unwrap().decode().unwrap();
                if job.completed {
                    return job;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap()
    }

    fn doc(id: &str, value: serde_json::Value) -> Document {
        Document { id: id.to_string(), fields: fields(value) }
    }

    #[test]
    fn only_changed_non_pending_tasks_are_reported() {
        let mut watcher = TaskWatcher::new(Arc::new(MemoryRegistry::new()));
        let first = watcher.changed(vec![
            doc("t1", json!({"job": "jobs/j1", "status": "pending"})),
            doc("t2", json!({"job": "jobs/j2", "status": "error", "completed": true})),
        ]);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].job, "jobs/j2");

        let again = watcher.changed(vec![
            doc("t1", json!({"job": "jobs/j1", "status": "success", "completed": true})),
            doc("t2", json!({"job": "jobs/j2", "status": "error", "completed": true})),
        ]);
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].job, "jobs/j1");
    }

    #[test]
    fn one_update_per_job() {
        let mut watcher = TaskWatcher::new(Arc::new(MemoryRegistry::new()));
        let changed = watcher.changed(vec![
            doc("t1", json!({"job": "jobs/j1", "status": "success", "completed": true})),
            doc("t2", json!({"job": "jobs/j1", "status": "error", "completed": true})),
        ]);
        assert_eq!(changed.len(), 1);
    }

    #[tokio::test]
    async fn completing_tasks_updates_the_job() {
        let reg = MemoryRegistry::new();
        seed_artifacts(&reg).await;
        seed_devices(&reg, &["d1", "d2"]).await;
        let request = JobRequest { artifact: format!("{ARTIFACTS}/debug-prod"), ..Default::default() };
        let created = create_job(&reg, &request, Duration::from_secs(60)).await.unwrap();

        let watcher = tokio::spawn(TaskWatcher::new(Arc::new(reg.clone())).run());
        for id in &created.task_ids {
            reg.set(JOB_TASKS, id, fields(json!({"status": "success", "completed": true})), true)
                .await
                .unwrap();
        }

        let job = wait_completed(&reg, &created.job_id).await;
        assert_eq!(job.status, JobStatus::Success);
        watcher.abort();
    }

    #[tokio::test]
    async fn failed_job_update_is_retried() {
        let reg = MemoryRegistry::new();
        seed_artifacts(&reg).await;
        seed_devices(&reg, &["d1"]).await;
        let request = JobRequest { artifact: format!("{ARTIFACTS}/debug-prod"), ..Default::default() };
        let created = create_job(&reg, &request, Duration::from_secs(60)).await.unwrap();

        let flaky = FailingRegistry::new(reg.clone());
        flaky.fail_sets(JOBS, None, 1);
        let watcher = tokio::spawn(
            TaskWatcher::new(Arc::new(flaky))
                .with_retry_interval(Duration::from_millis(20))
                .run(),
        );
        reg.set(JOB_TASKS, &created.task_ids[0], fields(json!({"status": "success", "completed": true})), true)
            .await
            .unwrap();

        let job = wait_completed(&reg, &created.job_id).await;
        assert_eq!(job.status, JobStatus::Success);
        watcher.abort();
    }
}

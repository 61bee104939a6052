//! Narrow interface to a durable execution engine.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use ctp_core::ApiError;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed | TaskState::Cancelled)
    }

    pub fn parse(raw: &str) -> Option<TaskState> {
        match raw {
            "queued" => Some(TaskState::Queued),
            "running" => Some(TaskState::Running),
            "completed" => Some(TaskState::Completed),
            "failed" => Some(TaskState::Failed),
            "cancelled" => Some(TaskState::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub workflow_id: String,
    pub task_name: String,
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub meta: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// What a caller hands to `submit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSubmission {
    pub task_name: String,
    pub parameters: serde_json::Value,
    #[serde(default = "default_queue")]
    pub queue: String,
    pub workflow_id: Option<String>,
}

fn default_queue() -> String {
    "default".to_string()
}

/// The only interface the rest of the system sees.
pub trait WorkflowEngine: Send + Sync {
    fn submit(&self, submission: TaskSubmission) -> BoxFuture<'_, Result<String, ApiError>>;
    fn status<'a>(&'a self, workflow_id: &'a str) -> BoxFuture<'a, Result<Option<TaskInfo>, ApiError>>;
    fn result<'a>(&'a self, workflow_id: &'a str)
        -> BoxFuture<'a, Result<Option<TaskResult>, ApiError>>;
    fn cancel<'a>(&'a self, workflow_id: &'a str) -> BoxFuture<'a, Result<bool, ApiError>>;
    fn list(
        &self,
        limit: usize,
        offset: usize,
        state: Option<TaskState>,
    ) -> BoxFuture<'_, Result<(Vec<TaskInfo>, usize), ApiError>>;
}

pub type SharedEngine = Arc<dyn WorkflowEngine>;

// ── Local engine ─────────────────────────────────────────────────────────

type TaskHandler = Arc<
    dyn Fn(serde_json::Value) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, String>> + Send>>
        + Send
        + Sync,
>;

struct TaskRecord {
    info: TaskInfo,
    result: Option<TaskResult>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

/// In-process engine: registered handlers run as spawned tasks. Serves as
/// the default deployment backend and the test double for the gateway.
#[derive(Clone)]
pub struct LocalWorkflowEngine {
    handlers: Arc<HashMap<String, TaskHandler>>,
    records: Arc<DashMap<String, TaskRecord>>,
}

pub struct LocalEngineBuilder {
    handlers: HashMap<String, TaskHandler>,
}

impl LocalEngineBuilder {
    pub fn handler<F, Fut>(mut self, task_name: &str, f: F) -> Self
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, String>> + Send + 'static,
    {
        self.handlers
            .insert(task_name.to_string(), Arc::new(move |params| Box::pin(f(params))));
        self
    }

    pub fn build(self) -> LocalWorkflowEngine {
        LocalWorkflowEngine {
            handlers: Arc::new(self.handlers),
            records: Arc::new(DashMap::new()),
        }
    }
}

impl LocalWorkflowEngine {
    pub fn builder() -> LocalEngineBuilder {
        LocalEngineBuilder {
            handlers: HashMap::new(),
        }
    }

    /// Engine with no registered handlers; every submission fails fast.
    pub fn empty() -> Self {
        Self::builder().build()
    }

    fn finish(records: &DashMap<String, TaskRecord>, workflow_id: &str, outcome: Result<serde_json::Value, String>) {
        if let Some(mut record) = records.get_mut(workflow_id) {
            if record.info.state == TaskState::Cancelled {
                return;
            }
            record.info.completed_at = Some(Utc::now());
            match outcome {
                Ok(output) => {
                    record.info.state = TaskState::Completed;
                    record.result = Some(TaskResult {
                        output: Some(output),
                        error: None,
                    });
                }
                Err(error) => {
                    record.info.state = TaskState::Failed;
                    record.result = Some(TaskResult {
                        output: None,
                        error: Some(error),
                    });
                }
            }
        }
    }
}

impl WorkflowEngine for LocalWorkflowEngine {
    fn submit(&self, submission: TaskSubmission) -> BoxFuture<'_, Result<String, ApiError>> {
        Box::pin(async move {
            let workflow_id = submission
                .workflow_id
                .clone()
                .unwrap_or_else(|| format!("{}-{}", submission.task_name, Uuid::new_v4()));

            if self.records.contains_key(&workflow_id) {
                return Err(ApiError::conflict().with_internal("duplicate workflow id"));
            }

            let handler = self.handlers.get(&submission.task_name).cloned();
            let now = Utc::now();
            let mut info = TaskInfo {
                workflow_id: workflow_id.clone(),
                task_name: submission.task_name.clone(),
                state: TaskState::Queued,
                created_at: now,
                started_at: None,
                completed_at: None,
                meta: serde_json::json!({ "queue": submission.queue }),
            };

            let Some(handler) = handler else {
                warn!(task = %submission.task_name, "no handler registered");
                info.state = TaskState::Failed;
                info.completed_at = Some(now);
                self.records.insert(
                    workflow_id.clone(),
                    TaskRecord {
                        info,
                        result: Some(TaskResult {
                            output: None,
                            error: Some(format!("unknown task: {}", submission.task_name)),
                        }),
                        handle: None,
                    },
                );
                return Ok(workflow_id);
            };

            info.state = TaskState::Running;
            info.started_at = Some(now);

            let records = self.records.clone();
            let id_for_task = workflow_id.clone();
            let parameters = submission.parameters.clone();
            let handle = tokio::spawn(async move {
                let outcome = handler(parameters).await;
                LocalWorkflowEngine::finish(&records, &id_for_task, outcome);
            });

            self.records.insert(
                workflow_id.clone(),
                TaskRecord {
                    info,
                    result: None,
                    handle: Some(handle),
                },
            );
            info!(workflow_id = %workflow_id, "workflow submitted");
            Ok(workflow_id)
        })
    }

    fn status<'a>(
        &'a self,
        workflow_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<TaskInfo>, ApiError>> {
        Box::pin(async move { Ok(self.records.get(workflow_id).map(|r| r.info.clone())) })
    }

    fn result<'a>(
        &'a self,
        workflow_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<TaskResult>, ApiError>> {
        Box::pin(async move { Ok(self.records.get(workflow_id).and_then(|r| r.result.clone())) })
    }

    fn cancel<'a>(&'a self, workflow_id: &'a str) -> BoxFuture<'a, Result<bool, ApiError>> {
        Box::pin(async move {
            let Some(mut record) = self.records.get_mut(workflow_id) else {
                return Ok(false);
            };
            if record.info.state.is_terminal() {
                return Ok(false);
            }
            if let Some(handle) = record.handle.take() {
                handle.abort();
            }
            record.info.state = TaskState::Cancelled;
            record.info.completed_at = Some(Utc::now());
            record.result = Some(TaskResult {
                output: None,
                error: Some("cancelled".to_string()),
            });
            info!(workflow_id, "workflow cancelled");
            Ok(true)
        })
    }

    fn list(
        &self,
        limit: usize,
        offset: usize,
        state: Option<TaskState>,
    ) -> BoxFuture<'_, Result<(Vec<TaskInfo>, usize), ApiError>> {
        Box::pin(async move {
            let mut infos: Vec<TaskInfo> = self
                .records
                .iter()
                .map(|r| r.info.clone())
                .filter(|i| state.map(|s| i.state == s).unwrap_or(true))
                .collect();
            infos.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            let total = infos.len();
            let page = infos.into_iter().skip(offset).take(limit).collect();
            Ok((page, total))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn engine() -> LocalWorkflowEngine {
        LocalWorkflowEngine::builder()
            .handler("echo", |params| async move { Ok(params) })
            .handler("fail", |_| async move { Err("boom".to_string()) })
            .handler("slow", |params| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(params)
            })
            .build()
    }

    async fn wait_terminal(engine: &LocalWorkflowEngine, id: &str) -> TaskInfo {
        for _ in 0..100 {
            let info = engine.status(id).await.unwrap().unwrap();
            if info.state.is_terminal() {
                return info;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("workflow never finished");
    }

    fn submission(task_name: &str, workflow_id: Option<&str>) -> TaskSubmission {
        TaskSubmission {
            task_name: task_name.to_string(),
            parameters: serde_json::json!({"n": 1}),
            queue: "default".to_string(),
            workflow_id: workflow_id.map(String::from),
        }
    }

    #[tokio::test]
    async fn submit_runs_handler_and_records_result() {
        let engine = engine();
        let id = engine.submit(submission("echo", None)).await.unwrap();
        let info = wait_terminal(&engine, &id).await;
        assert_eq!(info.state, TaskState::Completed);

        let result = engine.result(&id).await.unwrap().unwrap();
        assert_eq!(result.output, Some(serde_json::json!({"n": 1})));
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn handler_errors_become_failed_state() {
        let engine = engine();
        let id = engine.submit(submission("fail", None)).await.unwrap();
        let info = wait_terminal(&engine, &id).await;
        assert_eq!(info.state, TaskState::Failed);
        assert_eq!(engine.result(&id).await.unwrap().unwrap().error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn unknown_task_fails_immediately() {
        let engine = engine();
        let id = engine.submit(submission("nope", None)).await.unwrap();
        let info = engine.status(&id).await.unwrap().unwrap();
        assert_eq!(info.state, TaskState::Failed);
    }

    #[tokio::test]
    async fn explicit_workflow_ids_are_respected_and_unique() {
        let engine = engine();
        let id = engine.submit(submission("echo", Some("w-1"))).await.unwrap();
        assert_eq!(id, "w-1");
        let err = engine.submit(submission("echo", Some("w-1"))).await.unwrap_err();
        assert_eq!(err.code, "CONF_001");
    }

    #[tokio::test]
    async fn cancel_aborts_running_workflows() {
        let engine = engine();
        let id = engine.submit(submission("slow", None)).await.unwrap();
        assert!(engine.cancel(&id).await.unwrap());
        let info = engine.status(&id).await.unwrap().unwrap();
        assert_eq!(info.state, TaskState::Cancelled);
        // Cancelling twice is a no-op.
        assert!(!engine.cancel(&id).await.unwrap());
    }

    #[tokio::test]
    async fn list_filters_by_state_and_pages() {
        let engine = engine();
        for _ in 0..3 {
            engine.submit(submission("echo", None)).await.unwrap();
        }
        let slow = engine.submit(submission("slow", None)).await.unwrap();

        // Wait for the echoes to finish.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (all, total) = engine.list(10, 0, None).await.unwrap();
        assert_eq!(total, 4);
        assert_eq!(all.len(), 4);

        let (running, running_total) = engine.list(10, 0, Some(TaskState::Running)).await.unwrap();
        assert_eq!(running_total, 1);
        assert_eq!(running[0].workflow_id, slow);

        let (page, paged_total) = engine.list(2, 1, None).await.unwrap();
        assert_eq!(paged_total, 4);
        assert_eq!(page.len(), 2);
    }
}

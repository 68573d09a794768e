// Pending-request coordination - deferred relation saves per mutating call

pub mod queue;

use crate::document::Id;
use crate::error::{Result, ShardboxError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use uuid::Uuid;

/// The save operation a deferred task performs. Tasks carry fully
/// validated documents; execution is storage-level only.
#[derive(Debug, Clone)]
pub enum TaskOp {
    SaveOne { collection: String, doc: Value },
    SaveMany { collection: String, docs: Vec<Value> },
    UpdateOne { collection: String, id: Id, doc: Value },
}

/// A deferred relation save, keyed by the dotted path of the relation
/// field that produced it.
#[derive(Debug, Clone)]
pub struct DeferredTask {
    pub path: String,
    pub op: TaskOp,
}

struct PendingRequest {
    tasks: Vec<DeferredTask>,
    task_count: usize,
    done_count: usize,
    completed: HashMap<String, Value>,
}

type RequestTable = Arc<Mutex<HashMap<Uuid, PendingRequest>>>;

/// Tracks the deferred tasks of every open mutating call, keyed by a
/// per-call token. Owned by the Database handle; requests are removed on
/// close, success or failure alike.
///
/// Sibling tasks that completed before a later task fails are not rolled
/// back - there is no cross-task atomicity.
pub struct RequestCoordinator {
    requests: RequestTable,
}

fn lock_table(table: &RequestTable) -> Result<MutexGuard<'_, HashMap<Uuid, PendingRequest>>> {
    table
        .lock()
        .map_err(|_| ShardboxError::Cache("pending-request table lock poisoned".into()))
}

/// Record one task's result. Returns the full path→result map once every
/// task of the request has completed. A missing token means the request
/// was force-closed while the task ran; the result is discarded.
fn complete_task(
    table: &RequestTable,
    token: Uuid,
    path: &str,
    result: Value,
) -> Result<Option<HashMap<String, Value>>> {
    let mut requests = lock_table(table)?;
    let request = match requests.get_mut(&token) {
        Some(r) => r,
        None => return Ok(None),
    };
    request.completed.insert(path.to_string(), result);
    request.done_count += 1;
    if request.done_count == request.task_count {
        return Ok(Some(request.completed.clone()));
    }
    Ok(None)
}

impl RequestCoordinator {
    pub fn new() -> RequestCoordinator {
        RequestCoordinator {
            requests: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Open a request with a fresh token. Every nested validation call of
    /// the originating operation carries this token.
    pub fn open_request(&self) -> Result<Uuid> {
        let token = Uuid::new_v4();
        let mut requests = lock_table(&self.requests)?;
        requests.insert(
            token,
            PendingRequest {
                tasks: Vec::new(),
                task_count: 0,
                done_count: 0,
                completed: HashMap::new(),
            },
        );
        Ok(token)
    }

    /// Register a deferred task under an open request. One task per
    /// relation path; a duplicate path is an invariant violation.
    pub fn schedule_task(&self, token: Uuid, task: DeferredTask) -> Result<()> {
        let mut requests = lock_table(&self.requests)?;
        let request = requests
            .get_mut(&token)
            .ok_or_else(|| ShardboxError::Cache(format!("no pending request for token {token}")))?;
        if request.tasks.iter().any(|t| t.path == task.path) {
            return Err(ShardboxError::Cache(format!(
                "a task is already scheduled for relation path '{}'",
                task.path
            )));
        }
        request.tasks.push(task);
        request.task_count += 1;
        Ok(())
    }

    pub fn task_count(&self, token: Uuid) -> Result<usize> {
        let requests = lock_table(&self.requests)?;
        Ok(requests.get(&token).map_or(0, |r| r.task_count))
    }

    /// Remove a request, discarding any still-pending tasks.
    pub fn close_request(&self, token: Uuid) {
        if let Ok(mut requests) = lock_table(&self.requests) {
            requests.remove(&token);
        }
    }

    /// Execute the request's tasks sequentially, in registration order, on
    /// a dedicated thread, and await the completion signal with a bounded
    /// wait. On timeout the request is force-closed and `Timeout` raised;
    /// a task failure propagates the task's error.
    pub fn run_scheduled_tasks<E>(
        &self,
        token: Uuid,
        execute: E,
        timeout: Duration,
    ) -> Result<HashMap<String, Value>>
    where
        E: Fn(&TaskOp) -> Result<Value> + Send + 'static,
    {
        let tasks = {
            let mut requests = lock_table(&self.requests)?;
            let request = requests.get_mut(&token).ok_or_else(|| {
                ShardboxError::Cache(format!("no pending request for token {token}"))
            })?;
            std::mem::take(&mut request.tasks)
        };
        if tasks.is_empty() {
            return Ok(HashMap::new());
        }

        let (tx, rx) = mpsc::channel::<Result<HashMap<String, Value>>>();
        let table = Arc::clone(&self.requests);
        let runner = thread::Builder::new()
            .name("shardbox-tasks".to_string())
            .spawn(move || {
                for task in tasks {
                    match execute(&task.op) {
                        Ok(result) => match complete_task(&table, token, &task.path, result) {
                            Ok(Some(completed)) => {
                                let _ = tx.send(Ok(completed));
                                return;
                            }
                            Ok(None) => {}
                            Err(e) => {
                                let _ = tx.send(Err(e));
                                return;
                            }
                        },
                        Err(e) => {
                            let _ = tx.send(Err(e));
                            return;
                        }
                    }
                }
            });
        if let Err(e) = runner {
            self.close_request(token);
            return Err(e.into());
        }

        match rx.recv_timeout(timeout) {
            Ok(outcome) => {
                if outcome.is_err() {
                    self.close_request(token);
                }
                outcome
            }
            Err(_) => {
                self.close_request(token);
                Err(ShardboxError::Timeout(timeout.as_millis() as u64))
            }
        }
    }
}

impl Default for RequestCoordinator {
    fn default() -> Self {
        RequestCoordinator::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn save_task(path: &str) -> DeferredTask {
        DeferredTask {
            path: path.to_string(),
            op: TaskOp::SaveOne {
                collection: path.to_string(),
                doc: json!({"id": 1}),
            },
        }
    }

    #[test]
    fn test_duplicate_path_rejected() {
        let coordinator = RequestCoordinator::new();
        let token = coordinator.open_request().unwrap();
        coordinator.schedule_task(token, save_task("author")).unwrap();
        let err = coordinator
            .schedule_task(token, save_task("author"))
            .unwrap_err();
        assert!(matches!(err, ShardboxError::Cache(_)));
    }

    #[test]
    fn test_schedule_requires_open_request() {
        let coordinator = RequestCoordinator::new();
        let token = Uuid::new_v4();
        assert!(coordinator.schedule_task(token, save_task("x")).is_err());
    }

    #[test]
    fn test_tasks_run_in_registration_order() {
        let coordinator = RequestCoordinator::new();
        let token = coordinator.open_request().unwrap();
        coordinator.schedule_task(token, save_task("a")).unwrap();
        coordinator.schedule_task(token, save_task("b")).unwrap();
        coordinator.schedule_task(token, save_task("c")).unwrap();

        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        let results = coordinator
            .run_scheduled_tasks(
                token,
                move |op| {
                    if let TaskOp::SaveOne { collection, .. } = op {
                        record.lock().unwrap().push(collection.clone());
                    }
                    Ok(json!("ok"))
                },
                Duration::from_millis(3000),
            )
            .unwrap();
        coordinator.close_request(token);

        assert_eq!(results.len(), 3);
        assert!(results.contains_key("a"));
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_no_tasks_is_a_no_op() {
        let coordinator = RequestCoordinator::new();
        let token = coordinator.open_request().unwrap();
        let results = coordinator
            .run_scheduled_tasks(token, |_| Ok(json!(null)), Duration::from_millis(100))
            .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_task_failure_propagates_and_closes() {
        let coordinator = RequestCoordinator::new();
        let token = coordinator.open_request().unwrap();
        coordinator.schedule_task(token, save_task("a")).unwrap();
        let err = coordinator
            .run_scheduled_tasks(
                token,
                |_| Err(ShardboxError::Validation("bad".into())),
                Duration::from_millis(3000),
            )
            .unwrap_err();
        assert!(matches!(err, ShardboxError::Validation(_)));
        // force-closed: the token is gone
        assert!(coordinator.schedule_task(token, save_task("b")).is_err());
    }

    #[test]
    fn test_timeout_force_closes() {
        let coordinator = RequestCoordinator::new();
        let token = coordinator.open_request().unwrap();
        coordinator.schedule_task(token, save_task("a")).unwrap();
        let err = coordinator
            .run_scheduled_tasks(
                token,
                |_| {
                    thread::sleep(Duration::from_millis(200));
                    Ok(json!(null))
                },
                Duration::from_millis(20),
            )
            .unwrap_err();
        assert!(matches!(err, ShardboxError::Timeout(_)));
        assert!(coordinator.schedule_task(token, save_task("b")).is_err());
    }
}

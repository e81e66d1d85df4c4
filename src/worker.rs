//! Fixed-size pools of workers pulling tasks off a shared queue.
//!
//! Each worker runs one task at a time under that task's deadline and
//! reports `Started` / `Finished` events to the scheduler. Workers never touch
//! the scan state.
use std::future::Future;
use std::sync::Arc;

use log::{debug, info};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::error::TaskError;
use crate::scheduler::QueueReceiver;
use crate::task::{RawResult, Task, TaskEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPool {
    name: String,
    concurrency: usize,
}

impl WorkerPool {
    /// A pool of `concurrency` workers; at least one is always started.
    pub fn new(name: impl Into<String>, concurrency: usize) -> Self {
        Self {
            name: name.into(),
            concurrency: concurrency.max(1),
        }
    }

    pub const fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Starts the workers.
    ///
    /// They exit once the queue is closed and drained, when `reports` has no
    /// receiver, or when `cancel` fires. On cancellation the running task's
    /// future is dropped, which kills any child process it spawned, and no
    /// `Finished` event is sent for it.
    pub fn spawn<F, Fut>(
        &self,
        queue: QueueReceiver<Task>,
        task_fn: F,
        reports: UnboundedSender<TaskEvent>,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>>
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RawResult, TaskError>> + Send + 'static,
    {
        let task_fn = Arc::new(task_fn);
        (0..self.concurrency)
            .map(|i| {
                let id = format!("{}-{i}", self.name);
                tokio::spawn(work(
                    id,
                    queue.clone(),
                    Arc::clone(&task_fn),
                    reports.clone(),
                    cancel.clone(),
                ))
            })
            .collect()
    }
}

async fn work<F, Fut>(
    id: String,
    queue: QueueReceiver<Task>,
    task_fn: Arc<F>,
    reports: UnboundedSender<TaskEvent>,
    cancel: CancellationToken,
) where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = Result<RawResult, TaskError>> + Send,
{
    debug!("Worker {id} ready");
    loop {
        let task = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            task = queue.pop() => match task {
                Some(task) => task,
                None => break,
            },
        };

        let key = task.key.clone();
        let kind = task.kind;
        let deadline = task.deadline;
        debug!("Worker {id} took {kind} for {key}");
        if reports
            .send(TaskEvent::Started {
                key: key.clone(),
                kind,
            })
            .is_err()
        {
            break;
        }

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                info!("[{key}] {kind} abandoned");
                break;
            }
            result = time::timeout(deadline, task_fn(task)) => {
                result.unwrap_or(Err(TaskError::Timeout { kind, after: deadline }))
            }
        };

        if reports
            .send(TaskEvent::Finished { key, kind, outcome })
            .is_err()
        {
            break;
        }
    }
    debug!("Worker {id} stopped");
}

// Single-writer request queue - one worker thread per collection

use crate::error::{Result, ShardboxError};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

pub type QueueOp = Box<dyn FnOnce() -> Result<Value> + Send + 'static>;

struct QueueMsg {
    op: QueueOp,
    reply: mpsc::Sender<Result<Value>>,
}

/// FIFO serializer for a collection's mutating operations. Exactly one
/// operation is in flight at a time; submission blocks until the worker
/// has executed the operation and replied. Before admitting an operation
/// the worker sleeps `pending * step` to smooth bursts - a liveness aid,
/// not a correctness mechanism.
pub struct RequestQueue {
    tx: mpsc::Sender<QueueMsg>,
    pending: Arc<AtomicUsize>,
    _worker: thread::JoinHandle<()>,
}

impl RequestQueue {
    pub fn start(name: &str, step: Duration) -> Result<RequestQueue> {
        let (tx, rx) = mpsc::channel::<QueueMsg>();
        let pending = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pending);
        let worker = thread::Builder::new()
            .name(format!("shardbox-queue-{name}"))
            .spawn(move || {
                while let Ok(msg) = rx.recv() {
                    let backlog = counter.load(Ordering::SeqCst);
                    if !step.is_zero() && backlog > 1 {
                        thread::sleep(step * (backlog as u32 - 1));
                    }
                    let result = (msg.op)();
                    counter.fetch_sub(1, Ordering::SeqCst);
                    let _ = msg.reply.send(result);
                }
            })?;
        Ok(RequestQueue {
            tx,
            pending,
            _worker: worker,
        })
    }

    /// Enqueue an operation and block until it has run.
    pub fn run(&self, op: QueueOp) -> Result<Value> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self
            .tx
            .send(QueueMsg {
                op,
                reply: reply_tx,
            })
            .is_err()
        {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(ShardboxError::Other(
                "request queue worker is gone".into(),
            ));
        }
        reply_rx
            .recv()
            .map_err(|_| ShardboxError::Other("request queue dropped the operation".into()))?
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn test_ops_run_and_reply() {
        let queue = RequestQueue::start("t", Duration::ZERO).unwrap();
        let result = queue.run(Box::new(|| Ok(json!(42)))).unwrap();
        assert_eq!(result, json!(42));
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_errors_propagate() {
        let queue = RequestQueue::start("t", Duration::ZERO).unwrap();
        let result = queue.run(Box::new(|| {
            Err(ShardboxError::Validation("boom".into()))
        }));
        assert!(matches!(result, Err(ShardboxError::Validation(_))));
    }

    #[test]
    fn test_fifo_one_in_flight() {
        let queue = Arc::new(RequestQueue::start("t", Duration::ZERO).unwrap());
        let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..8u32 {
            let queue = Arc::clone(&queue);
            let order = Arc::clone(&order);
            let in_flight = Arc::clone(&in_flight);
            handles.push(thread::spawn(move || {
                queue
                    .run(Box::new(move || {
                        // exactly one op may be inside the worker at a time
                        assert_eq!(in_flight.fetch_add(1, Ordering::SeqCst), 0);
                        order.lock().unwrap().push(i);
                        thread::sleep(Duration::from_millis(2));
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok(json!(i))
                    }))
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(order.lock().unwrap().len(), 8);
    }
}

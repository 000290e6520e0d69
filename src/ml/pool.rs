use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use tracing::{error, info};

use crate::ml::classifier::{Classifier, ClassifyError, WorkerOutput};
use crate::utils::context::RequestContext;

const WAIT_SLICE: Duration = Duration::from_millis(25);

type Reply = Result<WorkerOutput, ClassifyError>;

struct ClassifyJob {
    path: PathBuf,
    ctx: RequestContext,
    reply: Sender<Reply>,
}

/// Fixed number of worker threads behind a bounded queue.
///
/// At most `workers` classifications run at once no matter how many requests
/// are in flight. Callers wait in the queue; a request whose deadline passes
/// or that is cancelled while queued is never started.
pub struct ClassifierPool {
    jobs: Option<Sender<ClassifyJob>>,
    handles: Vec<JoinHandle<()>>,
}

impl ClassifierPool {
    pub fn new(inner: Arc<dyn Classifier>, workers: usize, queue_depth: usize) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = bounded::<ClassifyJob>(queue_depth.max(1));

        let handles = (0..workers)
            .map(|i| {
                let rx = rx.clone();
                let inner = inner.clone();
                thread::spawn(move || run_worker(i, inner, rx))
            })
            .collect();

        info!("Classifier pool started with {} workers", workers);
        Self { jobs: Some(tx), handles }
    }

    pub fn workers(&self) -> usize {
        self.handles.len()
    }
}

fn run_worker(id: usize, inner: Arc<dyn Classifier>, rx: Receiver<ClassifyJob>) {
    for job in rx {
        let result = if job.ctx.is_cancelled() {
            Err(ClassifyError::Cancelled)
        } else if job.ctx.is_expired() {
            Err(ClassifyError::TimedOut(Duration::ZERO))
        } else {
            catch_unwind(AssertUnwindSafe(|| inner.classify(&job.path, &job.ctx))).unwrap_or_else(|_| {
                error!("Classifier worker {} panicked on {:?}", id, job.path);
                Err(ClassifyError::Malformed("classifier panicked".to_string()))
            })
        };
        // The caller may have given up already.
        let _ = job.reply.send(result);
    }
    info!("Classifier worker {} finished", id);
}

impl Classifier for ClassifierPool {
    fn classify(&self, path: &Path, ctx: &RequestContext) -> Result<WorkerOutput, ClassifyError> {
        let jobs = self.jobs.as_ref().ok_or(ClassifyError::PoolClosed)?;
        let started = Instant::now();
        let (reply_tx, reply_rx) = bounded(1);
        let mut job = ClassifyJob { path: path.to_path_buf(), ctx: ctx.clone(), reply: reply_tx };

        // Wait for a queue slot in slices so cancellation is seen even without a deadline.
        loop {
            match jobs.send_timeout(job, WAIT_SLICE) {
                Ok(()) => break,
                Err(SendTimeoutError::Disconnected(_)) => return Err(ClassifyError::PoolClosed),
                Err(SendTimeoutError::Timeout(back)) => {
                    if ctx.is_cancelled() {
                        return Err(ClassifyError::Cancelled);
                    }
                    if ctx.is_expired() {
                        return Err(ClassifyError::TimedOut(started.elapsed()));
                    }
                    job = back;
                }
            }
        }

        loop {
            match reply_rx.recv_timeout(WAIT_SLICE) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Disconnected) => return Err(ClassifyError::PoolClosed),
                Err(RecvTimeoutError::Timeout) => {
                    if ctx.is_cancelled() {
                        return Err(ClassifyError::Cancelled);
                    }
                    if ctx.is_expired() {
                        return Err(ClassifyError::TimedOut(started.elapsed()));
                    }
                }
            }
        }
    }
}

impl Drop for ClassifierPool {
    fn drop(&mut self) {
        // Closing the queue ends every worker loop once in-flight jobs finish.
        drop(self.jobs.take());
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::ml::classifier::{parse_worker_output, Classifier, ClassifyError, WorkerOutput};
use crate::utils::context::RequestContext;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Runs one external inference worker per image: `<program> <args...> <image path>`.
///
/// The worker must print a single JSON object to stdout and exit 0. It is
/// killed when the per-invocation timeout or the request deadline passes, or
/// when the request is cancelled.
#[derive(Debug, Clone)]
pub struct ProcessClassifier {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ProcessClassifier {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self { program: program.into(), args, timeout }
    }

    /// `python3 classify_image.py <path>` style worker.
    pub fn script(interpreter: impl Into<String>, script: &Path, timeout: Duration) -> Self {
        Self::new(interpreter, vec![script.to_string_lossy().to_string()], timeout)
    }
}

impl Classifier for ProcessClassifier {
    fn classify(&self, path: &Path, ctx: &RequestContext) -> Result<WorkerOutput, ClassifyError> {
        let started = Instant::now();
        let deadline = ctx.deadline_within(self.timeout);

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(ClassifyError::Launch)?;

        debug!(pid = child.id(), path = %path.display(), "Spawned classification worker");

        // Drain both pipes on their own threads so a chatty worker cannot block on a full pipe.
        let stdout = spawn_reader(child.stdout.take());
        let stderr = spawn_reader(child.stderr.take());

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(e) => {
                    kill(&mut child, path);
                    return Err(ClassifyError::Launch(e));
                }
            }
            if ctx.is_cancelled() {
                kill(&mut child, path);
                return Err(ClassifyError::Cancelled);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                kill(&mut child, path);
                return Err(ClassifyError::TimedOut(started.elapsed()));
            }
            thread::sleep(POLL_INTERVAL);
        };

        let stdout = join_reader(stdout);
        let stderr = join_reader(stderr);

        if !status.success() {
            return Err(ClassifyError::NonZeroExit {
                code: status.code(),
                stderr: stderr.trim().to_string(),
            });
        }

        parse_worker_output(&stdout)
    }
}

fn spawn_reader<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buffer = Vec::new();
            let _ = pipe.read_to_end(&mut buffer);
            String::from_utf8_lossy(&buffer).into_owned()
        })
    })
}

fn join_reader(handle: Option<JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

// Reader threads are left detached here: a grandchild may still hold the pipes open.
fn kill(child: &mut Child, path: &Path) {
    if let Err(e) = child.kill() {
        warn!(path = %path.display(), "Failed to kill classification worker: {}", e);
    }
    let _ = child.wait();
}

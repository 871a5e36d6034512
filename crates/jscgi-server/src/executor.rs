//! Script Executor
//!
//! Runs one request's script inside the worker's runtime and turns whatever
//! the script does into exactly one [`ExecutionResult`].
//!
//! A request moves through `Loaded -> Running` and ends in one of
//! `Completed`, `TimedOut` or `Errored`:
//!
//! 1. the file is read (missing file: 404, unreadable file: 500)
//! 2. the script's synchronous phase runs; a thrown error becomes a 500
//! 3. if the script has not responded yet and its timeout is positive, a
//!    deadline is armed; the script may lower or raise `req.timeout` while
//!    it runs, and the value in effect after step 2 is the one used
//! 4. the first of `res.send` (or a sibling) and the deadline wins; the
//!    deadline answers 408 and later responses are dropped with a warning
//!
//! The deadline is non-preemptive. A script stuck in a synchronous loop holds
//! the worker's thread, and the deadline can only fire once it yields.

use std::cell::{Cell, RefCell};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};

use jscgi_common::{CgiError, ExecutionResult};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::runtime::ScriptRuntime;

/// Lifecycle of a single script execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Loaded,
    Running,
    Completed,
    TimedOut,
    Errored,
}

/// Request data handed to a script as `req`.
#[derive(Debug, Clone)]
pub struct ScriptRequest {
    pub method: String,
    /// Path plus query string, as received
    pub url: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    /// Header pairs with lowercase names
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub ip: IpAddr,
    pub file_path: PathBuf,
    pub document_root: PathBuf,
}

struct Deadline {
    armed_at: Instant,
    task: AbortHandle,
}

/// Mutable state of one in-flight request.
///
/// Shared between the executor, the script's `res` object and the deadline
/// task. At most one deadline is armed at a time, and the response is
/// delivered at most once.
pub struct RequestContext {
    file_path: PathBuf,
    state: Cell<ExecutionState>,
    finished: Cell<bool>,
    status: Cell<u16>,
    headers: RefCell<Vec<(String, String)>>,
    deadline: RefCell<Option<Deadline>>,
    responder: RefCell<Option<oneshot::Sender<ExecutionResult>>>,
}

impl RequestContext {
    pub fn new(file_path: impl Into<PathBuf>) -> (Rc<Self>, oneshot::Receiver<ExecutionResult>) {
        let (tx, rx) = oneshot::channel();
        let ctx = Rc::new(Self {
            file_path: file_path.into(),
            state: Cell::new(ExecutionState::Loaded),
            finished: Cell::new(false),
            status: Cell::new(200),
            headers: RefCell::new(Vec::new()),
            deadline: RefCell::new(None),
            responder: RefCell::new(Some(tx)),
        });
        (ctx, rx)
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn state(&self) -> ExecutionState {
        self.state.get()
    }

    pub fn set_state(&self, state: ExecutionState) {
        self.state.set(state);
    }

    pub fn status(&self) -> u16 {
        self.status.get()
    }

    pub fn set_status(&self, status: u16) {
        self.status.set(status);
    }

    /// Sets a response header, replacing any earlier value of the same name.
    pub fn set_header(&self, name: &str, value: impl Into<String>) {
        let mut headers = self.headers.borrow_mut();
        headers.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
        headers.push((name.to_ascii_lowercase(), value.into()));
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .borrow()
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.clone())
    }

    /// Headers set so far, drained for the final response.
    pub fn take_headers(&self) -> Vec<(String, String)> {
        std::mem::take(&mut *self.headers.borrow_mut())
    }

    pub fn is_finished(&self) -> bool {
        self.finished.get()
    }

    /// Claims the right to respond and cancels the deadline.
    ///
    /// Returns false if the request was already answered; the late attempt is
    /// logged and must be dropped by the caller.
    pub fn finish(&self) -> bool {
        if self.finished.replace(true) {
            tracing::warn!(
                "Ignoring response for {} after the request was already answered",
                self.file_path.display()
            );
            return false;
        }
        self.cancel_deadline();
        true
    }

    /// Sends the response. Only meaningful after a successful [`finish`](Self::finish).
    pub fn deliver(&self, result: ExecutionResult) {
        if self.state.get() == ExecutionState::Running {
            self.state.set(ExecutionState::Completed);
        }
        if let Some(tx) = self.responder.borrow_mut().take() {
            // The receiver is gone if the client hung up
            let _ = tx.send(result);
        }
    }

    /// [`finish`](Self::finish) followed by [`deliver`](Self::deliver).
    pub fn respond(&self, result: ExecutionResult) -> bool {
        if !self.finish() {
            return false;
        }
        self.deliver(result);
        true
    }

    /// Arms the deadline. A no-op once the request has been answered.
    ///
    /// Any deadline already armed is replaced, so there is never more than one.
    pub fn arm_deadline(self: &Rc<Self>, timeout: Duration) {
        if self.is_finished() {
            return;
        }
        self.cancel_deadline();

        let ctx = self.clone();
        let task = tokio::task::spawn_local(async move {
            tokio::time::sleep(timeout).await;
            ctx.expire();
        });

        *self.deadline.borrow_mut() = Some(Deadline {
            armed_at: Instant::now(),
            task: task.abort_handle(),
        });
    }

    /// Cancels the armed deadline, if any. Safe to call repeatedly.
    pub fn cancel_deadline(&self) -> bool {
        match self.deadline.borrow_mut().take() {
            Some(deadline) => {
                deadline.task.abort();
                tracing::debug!("Timeout cleared for {}", self.file_path.display());
                true
            }
            None => false,
        }
    }

    pub fn has_deadline(&self) -> bool {
        self.deadline.borrow().is_some()
    }

    fn expire(&self) {
        // Runs on the deadline task itself, so it is not aborted here
        let Some(deadline) = self.deadline.borrow_mut().take() else {
            return;
        };
        if self.finished.replace(true) {
            return;
        }

        let err = CgiError::Timeout {
            elapsed_ms: deadline.armed_at.elapsed().as_millis(),
            path: self.file_path.clone(),
        };
        tracing::error!("{}", err);
        self.state.set(ExecutionState::TimedOut);
        self.deliver(err.into_result());
    }
}

/// Runs scripts against a worker's [`ScriptRuntime`].
pub struct ScriptExecutor {
    runtime: Rc<ScriptRuntime>,
    default_timeout: Option<Duration>,
}

impl ScriptExecutor {
    pub fn new(runtime: Rc<ScriptRuntime>, default_timeout: Option<Duration>) -> Self {
        Self {
            runtime,
            default_timeout,
        }
    }

    pub fn runtime(&self) -> &Rc<ScriptRuntime> {
        &self.runtime
    }

    /// Executes the script named by `request.file_path` and waits for its response.
    pub async fn execute(&self, request: ScriptRequest) -> ExecutionResult {
        tracing::info!("{}: {}", request.method, request.file_path.display());

        let source = match load_source(&request.file_path).await {
            Ok(source) => source,
            Err(err) => {
                match &err {
                    CgiError::NotFound(_) => tracing::debug!("{}", err),
                    _ => tracing::error!("{}", err),
                }
                return err.into_result();
            }
        };

        let (ctx, response) = RequestContext::new(request.file_path.clone());
        ctx.set_state(ExecutionState::Running);

        match self
            .runtime
            .run_script(&ctx, &request, &source, self.default_timeout)
        {
            Ok(timeout) => {
                if let Some(timeout) = timeout {
                    ctx.arm_deadline(timeout);
                }
            }
            Err(err) => {
                tracing::error!("{}", err);
                if ctx.finish() {
                    ctx.set_state(ExecutionState::Errored);
                    ctx.deliver(err.into_result());
                }
            }
        }

        let file_path = request.file_path;
        drop(ctx);
        response.await.unwrap_or_else(|_| {
            // Every handle to the request was dropped without an answer
            let err = CgiError::Script {
                message: format!("Script finished without responding: {}", file_path.display()),
                stack: format!("Script finished without responding\n    at {}", file_path.display()),
            };
            tracing::error!("{}", err);
            err.into_result()
        })
    }
}

/// Reads a script file, mapping a missing file (or a directory) to `NotFound`.
pub async fn load_source(path: &Path) -> jscgi_common::Result<String> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => {}
        Ok(_) => return Err(CgiError::NotFound(path.to_path_buf())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(CgiError::NotFound(path.to_path_buf()))
        }
        Err(source) => {
            return Err(CgiError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    }

    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| CgiError::Read {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use jscgi_common::ResponseBody;
    use tokio::task::LocalSet;

    #[tokio::test]
    async fn test_respond_is_first_wins() {
        let (ctx, rx) = RequestContext::new("/srv/www/a.js");
        ctx.set_state(ExecutionState::Running);

        assert!(ctx.respond(ExecutionResult::text(200, "first")));
        assert!(!ctx.respond(ExecutionResult::text(200, "second")));
        assert!(ctx.is_finished());
        assert_eq!(ctx.state(), ExecutionState::Completed);

        let result = rx.await.unwrap();
        assert_eq!(result.body, ResponseBody::Text("first".into()));
    }

    #[tokio::test]
    async fn test_deadline_answers_408() {
        LocalSet::new()
            .run_until(async {
                let (ctx, rx) = RequestContext::new("/srv/www/slow.js");
                ctx.set_state(ExecutionState::Running);
                ctx.arm_deadline(Duration::from_millis(20));
                assert!(ctx.has_deadline());

                let result = rx.await.unwrap();
                assert_eq!(result.status, 408);
                match result.body {
                    ResponseBody::Text(text) => {
                        assert!(text.starts_with("Timeout expired ("), "{}", text);
                        assert!(text.ends_with("ms) for /srv/www/slow.js"), "{}", text);
                    }
                    other => panic!("unexpected body {:?}", other),
                }
                assert_eq!(ctx.state(), ExecutionState::TimedOut);
                assert!(!ctx.has_deadline());

                // A response after the deadline is dropped
                assert!(!ctx.respond(ExecutionResult::text(200, "late")));
            })
            .await;
    }

    #[tokio::test]
    async fn test_respond_cancels_deadline() {
        LocalSet::new()
            .run_until(async {
                let (ctx, rx) = RequestContext::new("/srv/www/fast.js");
                ctx.set_state(ExecutionState::Running);
                ctx.arm_deadline(Duration::from_millis(30));

                assert!(ctx.respond(ExecutionResult::text(200, "done")));
                assert!(!ctx.has_deadline());
                assert!(!ctx.cancel_deadline());

                tokio::time::sleep(Duration::from_millis(60)).await;
                assert_eq!(rx.await.unwrap().status, 200);
                assert_eq!(ctx.state(), ExecutionState::Completed);
            })
            .await;
    }

    #[tokio::test]
    async fn test_no_deadline_after_finish() {
        LocalSet::new()
            .run_until(async {
                let (ctx, _rx) = RequestContext::new("/srv/www/sync.js");
                assert!(ctx.finish());
                ctx.arm_deadline(Duration::from_millis(10));
                assert!(!ctx.has_deadline());
            })
            .await;
    }

    #[tokio::test]
    async fn test_rearming_keeps_a_single_deadline() {
        LocalSet::new()
            .run_until(async {
                let (ctx, rx) = RequestContext::new("/srv/www/rearm.js");
                ctx.set_state(ExecutionState::Running);
                ctx.arm_deadline(Duration::from_millis(10));
                ctx.arm_deadline(Duration::from_millis(500));

                tokio::time::sleep(Duration::from_millis(50)).await;
                assert!(!ctx.is_finished());

                assert!(ctx.respond(ExecutionResult::empty(204)));
                assert_eq!(rx.await.unwrap().status, 204);
            })
            .await;
    }

    #[test]
    fn test_headers_replace_case_insensitively() {
        let (ctx, _rx) = RequestContext::new("/srv/www/h.js");
        ctx.set_header("Content-Type", "text/plain");
        ctx.set_header("content-type", "application/json");
        assert_eq!(ctx.header("CONTENT-TYPE").as_deref(), Some("application/json"));
        assert_eq!(ctx.take_headers().len(), 1);
    }

    #[tokio::test]
    async fn test_load_source_classifies_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.js");
        assert!(matches!(load_source(&missing).await, Err(CgiError::NotFound(_))));
        assert!(matches!(load_source(dir.path()).await, Err(CgiError::NotFound(_))));

        let file = dir.path().join("ok.js");
        std::fs::write(&file, "var x = 1;").unwrap();
        assert_eq!(load_source(&file).await.unwrap(), "var x = 1;");
    }
}

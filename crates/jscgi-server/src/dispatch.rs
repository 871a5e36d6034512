//! Request dispatch for a worker
//!
//! Every request walks the same pipeline:
//!
//! 1. application middleware installed by the boot hook (may answer early),
//!    including handlers mounted by a use file
//! 2. the access guard (401 for disallowed peers)
//! 3. path resolution from `path_translated` / `script_name` / the URL
//! 4. script execution
//!
//! The dispatcher produces an [`ExecutionResult`]; turning it into an HTTP
//! response is the server's job.

use std::cell::Cell;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::rc::Rc;
use std::time::Duration;

use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::http::request::Parts;
use hyper::Request;
use jscgi_common::{Config, ExecutionResult};

use crate::access::AccessGuard;
use crate::executor::{ScriptExecutor, ScriptRequest};
use crate::resolver::resolve;
use crate::runtime::ScriptRuntime;

pub type MiddlewareFuture<'a> = Pin<Box<dyn Future<Output = Option<ExecutionResult>> + 'a>>;

/// Application-level request hook.
///
/// Resolving to `Some` answers the request without running a script.
pub trait Middleware {
    fn handle<'a>(&'a self, head: &'a Parts, peer: SocketAddr) -> MiddlewareFuture<'a>;
}

impl<F> Middleware for F
where
    F: Fn(&Parts, SocketAddr) -> Option<ExecutionResult>,
{
    fn handle<'a>(&'a self, head: &'a Parts, peer: SocketAddr) -> MiddlewareFuture<'a> {
        Box::pin(std::future::ready(self(head, peer)))
    }
}

/// The application a worker serves, as configured by its boot hook.
#[derive(Default)]
pub struct App {
    middleware: Vec<Box<dyn Middleware>>,
    runtime: Option<Rc<ScriptRuntime>>,
    default_timeout: Option<Duration>,
}

impl App {
    pub fn new() -> Self {
        Self::default()
    }

    /// An app whose middleware may run JavaScript on the worker's runtime.
    pub fn with_runtime(runtime: Rc<ScriptRuntime>, default_timeout: Option<Duration>) -> Self {
        Self {
            middleware: Vec::new(),
            runtime: Some(runtime),
            default_timeout,
        }
    }

    pub fn runtime(&self) -> Option<&Rc<ScriptRuntime>> {
        self.runtime.as_ref()
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    /// Appends a middleware; middleware runs in insertion order.
    pub fn use_middleware(&mut self, middleware: impl Middleware + 'static) -> &mut Self {
        self.middleware.push(Box::new(middleware));
        self
    }

    pub fn middleware_count(&self) -> usize {
        self.middleware.len()
    }
}

/// Hook run once per worker before it starts listening.
pub type BootHook = Box<dyn FnOnce(&mut App)>;

pub struct Dispatcher {
    app: App,
    guard: AccessGuard,
    document_root: PathBuf,
    root_ready: Cell<bool>,
    executor: ScriptExecutor,
}

impl Dispatcher {
    pub fn new(app: App, config: &Config, executor: ScriptExecutor) -> Self {
        Self {
            app,
            guard: AccessGuard::new(config.localhost_only),
            document_root: config.document_root.clone(),
            root_ready: Cell::new(false),
            executor,
        }
    }

    pub fn executor(&self) -> &ScriptExecutor {
        &self.executor
    }

    pub async fn dispatch<B>(&self, req: Request<B>, peer: SocketAddr) -> ExecutionResult
    where
        B: Body,
        B::Error: std::fmt::Display,
    {
        let (head, body) = req.into_parts();

        for middleware in &self.app.middleware {
            if let Some(result) = middleware.handle(&head, peer).await {
                return result;
            }
        }

        if let Err(err) = self.guard.check(peer.ip()) {
            return err.into_result();
        }

        let resolved = resolve(&head.headers, &head.uri, &self.document_root);
        if resolved.default_root {
            self.ensure_document_root().await;
        }

        let body = match body.collect().await {
            Ok(collected) => String::from_utf8_lossy(&collected.to_bytes()).into_owned(),
            Err(e) => {
                tracing::warn!("Failed to read request body: {}", e);
                String::new()
            }
        };

        let request = script_request(&head, body, peer, resolved.file, resolved.document_root);
        self.executor.execute(request).await
    }

    /// Creates the configured document root the first time it is used.
    async fn ensure_document_root(&self) {
        if self.root_ready.get() {
            return;
        }
        match tokio::fs::create_dir_all(&self.document_root).await {
            Ok(()) => self.root_ready.set(true),
            Err(e) => tracing::warn!(
                "Could not create document root {}: {}",
                self.document_root.display(),
                e
            ),
        }
    }
}

/// Request data handed to a script or a mounted handler.
pub(crate) fn script_request(
    head: &Parts,
    body: String,
    peer: SocketAddr,
    file_path: PathBuf,
    document_root: PathBuf,
) -> ScriptRequest {
    ScriptRequest {
        method: head.method.to_string(),
        url: head
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| head.uri.path().to_string()),
        path: head.uri.path().to_string(),
        query: head
            .uri
            .query()
            .map(|query| {
                url::form_urlencoded::parse(query.as_bytes())
                    .into_owned()
                    .collect()
            })
            .unwrap_or_default(),
        headers: head
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect(),
        body,
        ip: peer.ip(),
        file_path,
        document_root,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;
    use hyper::body::Bytes;
    use jscgi_common::ResponseBody;
    use tokio::task::LocalSet;

    fn dispatcher(config: &Config, app: App) -> Dispatcher {
        let (runtime, _events) = ScriptRuntime::new(false).unwrap();
        let executor = ScriptExecutor::new(runtime, config.default_timeout());
        Dispatcher::new(app, config, executor)
    }

    fn get(uri: &str) -> Request<Full<Bytes>> {
        Request::builder().uri(uri).body(Full::new(Bytes::new())).unwrap()
    }

    fn local_peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_remote_peer_is_denied() {
        LocalSet::new()
            .run_until(async {
                let dir = tempfile::tempdir().unwrap();
                let config = Config::new().with_document_root(dir.path());
                let dispatcher = dispatcher(&config, App::new());

                let result = dispatcher
                    .dispatch(get("/app.js"), "10.1.2.3:5555".parse().unwrap())
                    .await;
                assert_eq!(result.status, 401);
                assert_eq!(result.body, ResponseBody::Empty);
            })
            .await;
    }

    #[tokio::test]
    async fn test_middleware_runs_before_guard() {
        LocalSet::new()
            .run_until(async {
                let dir = tempfile::tempdir().unwrap();
                let config = Config::new().with_document_root(dir.path());
                let mut app = App::new();
                app.use_middleware(|head: &Parts, _peer: SocketAddr| {
                    (head.uri.path() == "/health").then(|| ExecutionResult::text(200, "ok"))
                });
                let dispatcher = dispatcher(&config, app);

                let result = dispatcher
                    .dispatch(get("/health"), "10.1.2.3:5555".parse().unwrap())
                    .await;
                assert_eq!(result.status, 200);
                assert_eq!(result.body, ResponseBody::Text("ok".into()));
            })
            .await;
    }

    #[tokio::test]
    async fn test_script_under_translated_root() {
        LocalSet::new()
            .run_until(async {
                let dir = tempfile::tempdir().unwrap();
                let root = dir.path().canonicalize().unwrap();
                std::fs::write(
                    root.join("echo.js"),
                    "res.json({ path: req.path, q: req.query, body: req.body, method: req.method });",
                )
                .unwrap();
                let config = Config::new().with_document_root("/nonexistent-default");
                let dispatcher = dispatcher(&config, App::new());

                let req = Request::builder()
                    .method("POST")
                    .uri("/echo.js?a=1&b=two%20words")
                    .header("path_translated", root.to_str().unwrap())
                    .body(Full::new(Bytes::from("payload")))
                    .unwrap();
                let result = dispatcher.dispatch(req, local_peer()).await;

                assert_eq!(result.status, 200);
                let json: serde_json::Value = serde_json::from_slice(&result.body_bytes()).unwrap();
                assert_eq!(
                    json,
                    serde_json::json!({"path": "/echo.js", "q": {"a": "1", "b": "two words"}, "body": "payload", "method": "POST"})
                );
            })
            .await;
    }

    #[tokio::test]
    async fn test_missing_script_is_404_and_default_root_is_created() {
        LocalSet::new()
            .run_until(async {
                let dir = tempfile::tempdir().unwrap();
                let root = dir.path().join("www");
                let config = Config::new().with_document_root(&root);
                let dispatcher = dispatcher(&config, App::new());

                let req = Request::builder()
                    .uri("/whatever")
                    .header("script_name", "/missing.js")
                    .body(Full::new(Bytes::new()))
                    .unwrap();
                let result = dispatcher.dispatch(req, local_peer()).await;

                assert_eq!(result.status, 404);
                let expected = format!("File not found. {}/missing.js", root.display());
                assert_eq!(result.body, ResponseBody::Text(expected));
                assert!(root.is_dir());
            })
            .await;
    }
}

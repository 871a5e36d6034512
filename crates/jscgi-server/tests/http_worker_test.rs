//! HTTP Worker Integration Tests
//!
//! Each test starts a real worker on its own thread (a worker is
//! single-threaded and lives inside a `LocalSet`) and talks to it over HTTP
//! with reqwest, the way a reverse proxy would:
//! - status mapping (404, 408, 500) and script output
//! - script-controlled timeouts and late responses
//! - module caching across requests
//! - boot hook middleware and use-file handlers
//! - fatal timer errors ending the worker

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use jscgi_common::{CgiError, Config, ExecutionResult};
use jscgi_server::{App, Worker};
use reqwest::{Client, StatusCode};
use tempfile::TempDir;
use tokio::sync::oneshot;

// ============================================================================
// Test Helpers
// ============================================================================

struct TestWorker {
    addr: SocketAddr,
    root: TempDir,
    exited: oneshot::Receiver<jscgi_common::Result<()>>,
}

impl TestWorker {
    fn start(config: Config) -> Self {
        Self::start_with(config, |_app: &mut App| {})
    }

    fn start_with(config: Config, hook: impl FnOnce(&mut App) + Send + 'static) -> Self {
        let root = tempfile::tempdir().unwrap();
        let config = config
            .with_host("127.0.0.1".parse().unwrap())
            .with_port(0)
            .with_document_root(root.path().join("www"));

        let (addr_tx, addr_rx) = std::sync::mpsc::channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let local = tokio::task::LocalSet::new();
            local.block_on(&rt, async move {
                let bound = Worker::new(Arc::new(config))
                    .with_boot_hook(hook)
                    .bind()
                    .unwrap();
                addr_tx.send(bound.local_addr()).unwrap();
                let _ = exit_tx.send(bound.run().await);
            });
        });

        Self {
            addr: addr_rx.recv().unwrap(),
            root,
            exited: exit_rx,
        }
    }

    fn root(&self) -> &Path {
        self.root.path()
    }

    fn script(&self, name: &str, source: &str) {
        std::fs::write(self.root().join(name), source).unwrap();
    }

    /// Requests `/<name>` with the temp dir as the proxy-supplied document root.
    async fn get(&self, name: &str) -> reqwest::Response {
        Client::new()
            .get(format!("http://{}/{}", self.addr, name))
            .header("path_translated", self.root().to_str().unwrap())
            .send()
            .await
            .unwrap()
    }
}

// ============================================================================
// Status Mapping Tests
// ============================================================================

#[tokio::test]
async fn test_missing_script_is_404() {
    let worker = TestWorker::start(Config::new());

    let res = worker.get("missing.js").await;

    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let expected = format!("File not found. {}/missing.js", worker.root().display());
    assert_eq!(res.text().await.unwrap(), expected);
}

#[tokio::test]
async fn test_script_output_and_headers() {
    let worker = TestWorker::start(Config::new());
    worker.script(
        "hello.js",
        "res.status(201).set('X-Powered-By', 'jscgi').send('<p>hi ' + req.query.name + '</p>');",
    );

    let res = worker.get("hello.js?name=bob").await;

    assert_eq!(res.status(), StatusCode::CREATED);
    assert_eq!(res.headers()["x-powered-by"], "jscgi");
    assert!(res.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/html"));
    assert_eq!(res.text().await.unwrap(), "<p>hi bob</p>");
}

#[tokio::test]
async fn test_thrown_error_is_500_with_stack() {
    let worker = TestWorker::start(Config::new());
    worker.script("boom.js", "throw new Error('boom');");

    let res = worker.get("boom.js").await;

    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "Error: boom");
    assert!(!body["stack"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn test_cyclic_json_is_500_and_worker_survives() {
    let worker = TestWorker::start(Config::new());
    worker.script("cycle.js", "var o = {}; o.self = o; res.json(o);");
    worker.script("ok.js", "res.send('ok');");

    let res = worker.get("cycle.js").await;

    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: serde_json::Value = res.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().starts_with("TypeError"));
    assert!(!body["stack"].as_str().unwrap().is_empty());

    let res = worker.get("ok.js").await;
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_cgi_entry_point_is_called() {
    let worker = TestWorker::start(Config::new());
    worker.script(
        "entry.js",
        "function cgi(req, res) { res.json({ method: req.method, ip: req.ip }); }",
    );

    let res = worker.get("entry.js").await;

    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body, serde_json::json!({"method": "GET", "ip": "127.0.0.1"}));
}

// ============================================================================
// Deadline Tests
// ============================================================================

#[tokio::test]
async fn test_unanswered_request_times_out() {
    let worker = TestWorker::start(Config::new());
    worker.script("silent.js", "req.timeout = 200;");

    let started = Instant::now();
    let res = worker.get("silent.js").await;

    assert_eq!(res.status(), StatusCode::REQUEST_TIMEOUT);
    assert!(started.elapsed() >= Duration::from_millis(200));

    let text = res.text().await.unwrap();
    let elapsed: u64 = text
        .strip_prefix("Timeout expired (")
        .and_then(|rest| rest.split(' ').next())
        .unwrap()
        .parse()
        .unwrap();
    assert!(elapsed >= 200);
    assert!(text.ends_with(&format!("for {}/silent.js", worker.root().display())));
}

#[tokio::test]
async fn test_script_timeout_overrides_default() {
    let worker = TestWorker::start(Config::new().with_timeout_ms(100));
    worker.script(
        "slow.js",
        "req.timeout = 2000; setTimeout(function () { res.send('done'); }, 300);",
    );

    let res = worker.get("slow.js").await;

    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.unwrap(), "done");
}

#[tokio::test]
async fn test_late_response_after_timeout_is_ignored() {
    let worker = TestWorker::start(Config::new());
    worker.script(
        "late.js",
        "req.timeout = 100; setTimeout(function () { res.send('late'); }, 300);",
    );
    worker.script("ok.js", "res.send('ok');");

    let res = worker.get("late.js").await;
    assert_eq!(res.status(), StatusCode::REQUEST_TIMEOUT);

    // Let the late send happen, then check the worker still serves.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let res = worker.get("ok.js").await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.unwrap(), "ok");
}

// ============================================================================
// Module Tests
// ============================================================================

#[tokio::test]
async fn test_required_module_is_cached_between_requests() {
    let worker = TestWorker::start(Config::new());
    worker.script("counter.js", "var n = 0; module.exports = function () { return ++n; };");
    worker.script("count.js", "res.send(String(require('./counter.js')()));");

    assert_eq!(worker.get("count.js").await.text().await.unwrap(), "1");
    assert_eq!(worker.get("count.js").await.text().await.unwrap(), "2");
}

#[tokio::test]
async fn test_edited_module_is_reloaded_when_watching() {
    let worker = TestWorker::start(Config::new().with_watch(true));
    worker.script("value.js", "module.exports = 'first';");
    worker.script("show.js", "res.send(require('./value.js'));");

    assert_eq!(worker.get("show.js").await.text().await.unwrap(), "first");

    worker.script("value.js", "module.exports = 'second';");
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let text = worker.get("show.js").await.text().await.unwrap();
        if text == "second" {
            break;
        }
        assert!(Instant::now() < deadline, "module was never reloaded");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// ============================================================================
// Worker Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_boot_hook_middleware_answers_first() {
    let worker = TestWorker::start_with(Config::new(), |app: &mut App| {
        app.use_middleware(|head: &hyper::http::request::Parts, _peer: SocketAddr| {
            (head.uri.path() == "/health").then(|| ExecutionResult::text(200, "healthy"))
        });
    });

    let res = worker.get("health").await;

    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.unwrap(), "healthy");
}

#[tokio::test]
async fn test_use_file_handlers_answer_or_pass_through() {
    let dir = tempfile::tempdir().unwrap();
    let use_file = dir.path().join("use.js");
    std::fs::write(
        &use_file,
        r#"
        var seen = 0;
        module.exports = function (app) {
            app.use(function (req, res, next) { seen++; next(); });
            app.get('/health', function (req, res) { res.send('healthy ' + seen); });
        };
        "#,
    )
    .unwrap();

    let worker = TestWorker::start_with(Config::new(), move |app: &mut App| {
        assert_eq!(jscgi_server::use_file::install(app, &use_file), 2);
    });
    worker.script("ok.js", "res.send('script');");

    let res = worker.get("health").await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.unwrap(), "healthy 1");

    // The counter lives in the use file's module scope, so it survives requests
    let res = worker.get("ok.js").await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.unwrap(), "script");
    assert_eq!(worker.get("health").await.text().await.unwrap(), "healthy 3");
}

#[tokio::test]
async fn test_malformed_use_file_leaves_worker_serving() {
    let dir = tempfile::tempdir().unwrap();
    let use_file = dir.path().join("use.js");
    std::fs::write(&use_file, "module.exports = 42;").unwrap();

    let worker = TestWorker::start_with(Config::new(), move |app: &mut App| {
        assert_eq!(jscgi_server::use_file::install(app, &use_file), 0);
    });
    worker.script("ok.js", "res.send('ok');");

    let res = worker.get("ok.js").await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.unwrap(), "ok");
}

#[tokio::test]
async fn test_timer_exception_kills_worker() {
    let worker = TestWorker::start(Config::new());
    worker.script(
        "fatal.js",
        "setTimeout(function () { throw new Error('fatal'); }, 10); res.send('ok');",
    );

    let res = worker.get("fatal.js").await;
    assert_eq!(res.status(), StatusCode::OK);

    let result = tokio::time::timeout(Duration::from_secs(5), worker.exited)
        .await
        .unwrap()
        .unwrap();
    match result {
        Err(CgiError::WorkerFatal(message)) => assert!(message.contains("fatal")),
        other => panic!("expected a fatal worker error, got {:?}", other),
    }
}

//! Use file middleware
//!
//! Every worker looks for a JavaScript "use file" at boot (`use.js` next to
//! the executable unless configured otherwise). It exports
//! `function (app)`, and whatever it mounts on `app` runs in front of the
//! access guard, in mount order:
//!
//! ```js
//! module.exports = function (app) {
//!   app.get('/health', function (req, res) { res.send('ok'); });
//!   app.use(function (req, res, next) { res.set('X-Served-By', 'jscgi'); next(); });
//! };
//! ```
//!
//! A handler either answers through `res` or calls `next()` to pass the
//! request on. A missing use file is not an error.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use hyper::http::request::Parts;
use jscgi_common::ExecutionResult;
use tokio::sync::oneshot;

use crate::dispatch::{script_request, App, BootHook, Middleware, MiddlewareFuture};
use crate::executor::{ExecutionState, RequestContext};
use crate::runtime::{Route, ScriptRuntime};

/// Boot hook that mounts the handlers of the use file at `path`, if it exists.
pub fn use_file_hook(path: PathBuf) -> BootHook {
    Box::new(move |app: &mut App| {
        install(app, &path);
    })
}

/// Loads the use file at `path` and adds its handlers to `app`.
///
/// Returns how many handlers were mounted. Problems with the file are
/// logged; the worker starts either way.
pub fn install(app: &mut App, path: &Path) -> usize {
    if !path.is_file() {
        tracing::debug!("No use file at {}", path.display());
        return 0;
    }
    let Some(runtime) = app.runtime().cloned() else {
        tracing::warn!("Cannot load {}: the app has no script runtime", path.display());
        return 0;
    };

    tracing::info!("Loading {}...", path.display());
    let routes = match runtime.load_use_file(path) {
        Ok(routes) => routes,
        Err(err) => {
            tracing::error!("{}", err);
            return 0;
        }
    };

    let count = routes.len();
    let default_timeout = app.default_timeout();
    for route in routes {
        app.use_middleware(ScriptMiddleware {
            runtime: runtime.clone(),
            route,
            file: path.to_path_buf(),
            default_timeout,
        });
    }
    count
}

/// One handler mounted by a use file.
pub struct ScriptMiddleware {
    runtime: Rc<ScriptRuntime>,
    route: Route,
    file: PathBuf,
    default_timeout: Option<Duration>,
}

impl ScriptMiddleware {
    async fn run(&self, head: &Parts, peer: SocketAddr) -> Option<ExecutionResult> {
        if !self.route.matches(head.method.as_str(), head.uri.path()) {
            return None;
        }

        let document_root = self.file.parent().map(Path::to_path_buf).unwrap_or_default();
        let script = script_request(head, String::new(), peer, self.file.clone(), document_root);
        let (request, response) = RequestContext::new(self.file.clone());
        request.set_state(ExecutionState::Running);
        let (proceed, proceeded) = oneshot::channel();

        match self
            .runtime
            .run_handler(&self.route, &request, &script, proceed, self.default_timeout)
        {
            Ok(Some(timeout)) => request.arm_deadline(timeout),
            Ok(None) => {}
            Err(err) => {
                tracing::error!("{}", err);
                if request.finish() {
                    request.set_state(ExecutionState::Errored);
                    request.deliver(err.into_result());
                }
            }
        }

        tokio::select! {
            biased;
            Ok(result) = response => Some(result),
            Ok(()) = proceeded => {
                // Claims the response so `res` calls after `next()` are dropped
                if request.finish() {
                    request.set_state(ExecutionState::Completed);
                }
                None
            }
            else => None,
        }
    }
}

impl Middleware for ScriptMiddleware {
    fn handle<'a>(&'a self, head: &'a Parts, peer: SocketAddr) -> MiddlewareFuture<'a> {
        Box::pin(self.run(head, peer))
    }
}

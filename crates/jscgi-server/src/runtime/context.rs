use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use boa_engine::{js_string, object::JsObject, value::JsValue, Context, JsError, JsResult, Source};
use jscgi_common::config::timeout_from_ms;
use jscgi_common::{CgiError, Result};
use tokio::sync::oneshot;

use crate::executor::{RequestContext, ScriptRequest};
use crate::module_cache::ModuleCache;
use crate::runtime::app_object::{app_object, next_function, Route, Routes};
use crate::runtime::bindings::{Capabilities, CAPABILITY_PARAMS};
use crate::runtime::http_objects::{request_object, response_object};
use crate::runtime::job_executor::LocalJobExecutor;
use crate::runtime::modules::ModuleLoader;
use crate::runtime::timers::{FiredReceiver, TimerId, TimerQueue};
use crate::watcher::{run_invalidation, ChangeReceiver, FileWatcher};

const SCRIPT_PARAMS: &str = "req, res, require, __dirname, __filename";

/// Channels a runtime needs pumped; see [`ScriptRuntime::drive`].
pub struct RuntimeEvents {
    fired: FiredReceiver,
    changes: Option<ChangeReceiver>,
}

/// One worker's JavaScript runtime.
///
/// A single Boa context lives for the whole worker, so compiled modules can
/// be cached as live values. Each request script runs in a realm of its
/// own, so its globals are gone once the request is over.
pub struct ScriptRuntime {
    // These hold values from the context's heap and must drop before it.
    loader: Rc<ModuleLoader>,
    timers: Rc<TimerQueue>,
    jobs: Rc<LocalJobExecutor>,
    context: RefCell<Context>,
}

impl ScriptRuntime {
    /// Creates the runtime. With `watch_modules`, every loaded module is
    /// watched and evicted from the cache when it changes.
    pub fn new(watch_modules: bool) -> Result<(Rc<Self>, RuntimeEvents)> {
        let jobs = Rc::new(LocalJobExecutor::new());
        let mut context = Context::builder()
            .job_executor(jobs.clone())
            .build()
            .map_err(|e| CgiError::JavaScriptExecution(e.to_string()))?;

        let (timers, fired) = TimerQueue::new();
        let timers = Rc::new(timers);
        let capabilities = Capabilities::install(&mut context, &timers)?;

        let (watcher, changes) = if watch_modules {
            let (watcher, changes) = FileWatcher::new()?;
            (Some(watcher), Some(changes))
        } else {
            (None, None)
        };

        let runtime = Rc::new(Self {
            loader: Rc::new(ModuleLoader::new(capabilities, watcher)),
            timers,
            jobs,
            context: RefCell::new(context),
        });

        Ok((runtime, RuntimeEvents { fired, changes }))
    }

    pub fn module_cache(&self) -> &Rc<ModuleCache<JsValue>> {
        self.loader.cache()
    }

    pub fn watcher(&self) -> Option<&FileWatcher> {
        self.loader.watcher()
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.pending()
    }

    /// Runs a script's synchronous phase for one request.
    ///
    /// The script body runs first; if it defines a `cgi` function, that is
    /// then called with `(req, res)`. Queued promise reactions are drained
    /// afterwards. Returns the timeout to arm: `None` when the script has
    /// already responded or its timeout is disabled.
    pub fn run_script(
        &self,
        request: &Rc<RequestContext>,
        script: &ScriptRequest,
        source: &str,
        default_timeout: Option<Duration>,
    ) -> Result<Option<Duration>> {
        let mut context = self.context.borrow_mut();
        let ctx = &mut *context;

        // Globals a script creates, implicit ones included, stay in its own realm
        let realm = ctx
            .create_realm()
            .map_err(|e| CgiError::JavaScriptExecution(format!("Failed to create realm: {}", e)))?;
        let worker_realm = ctx.enter_realm(realm);
        let outcome = self.run_in_realm(ctx, request, script, source, default_timeout);
        ctx.enter_realm(worker_realm);
        outcome
    }

    fn run_in_realm(
        &self,
        ctx: &mut Context,
        request: &Rc<RequestContext>,
        script: &ScriptRequest,
        source: &str,
        default_timeout: Option<Duration>,
    ) -> Result<Option<Duration>> {
        let req = request_object(ctx, script, default_timeout)?;
        let outcome = self.call_script(ctx, &req, request, script, source);
        self.jobs.drain(ctx);

        if let Err(err) = outcome {
            return Err(script_error(err, &script.file_path, ctx));
        }
        if request.is_finished() {
            return Ok(None);
        }

        requested_timeout(&req, script, default_timeout, ctx)
    }

    fn call_script(
        &self,
        ctx: &mut Context,
        req: &JsObject,
        request: &Rc<RequestContext>,
        script: &ScriptRequest,
        source: &str,
    ) -> std::result::Result<(), JsError> {
        let file = &script.file_path;
        let dir = file.parent().unwrap_or(Path::new("/"));
        let file_name = file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let wrapped = format!(
            "(function ({}, {}) {{\n{}\n;return typeof cgi === 'function' ? cgi : undefined;\n}})",
            SCRIPT_PARAMS, CAPABILITY_PARAMS, source
        );
        let function = ctx.eval(Source::from_bytes(&wrapped))?;
        let Some(function) = function.as_object().map(|obj| obj.clone()) else {
            return Ok(());
        };

        let res = response_object(ctx, request, dir)?;
        let mut args = vec![
            JsValue::from(req.clone()),
            JsValue::from(res.clone()),
            self.loader.require_function(dir, ctx),
            JsValue::new(js_string!(dir.display().to_string())),
            JsValue::new(js_string!(file_name)),
        ];
        args.extend(self.loader.capabilities().values());

        let entry = function.call(&JsValue::undefined(), &args, ctx)?;
        if let Some(cgi) = entry.as_object().filter(|obj| obj.is_callable()) {
            cgi.call(
                &JsValue::undefined(),
                &[JsValue::from(req.clone()), JsValue::from(res)],
                ctx,
            )?;
        }
        Ok(())
    }

    /// Loads a use file and calls the function it exports with an `app`.
    ///
    /// Returns the handlers it mounted, in mount order.
    pub fn load_use_file(&self, path: &Path) -> Result<Vec<Route>> {
        let path = path.canonicalize().map_err(|source| CgiError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let dir = path.parent().unwrap_or(Path::new("/"));

        let mut context = self.context.borrow_mut();
        let ctx = &mut *context;

        let exports = self
            .loader
            .require(&path.display().to_string(), dir, ctx)
            .map_err(|err| script_error(err, &path, ctx))?;
        let Some(setup) = exports
            .as_object()
            .map(|obj| obj.clone())
            .filter(|obj| obj.is_callable())
        else {
            return Err(CgiError::MalformedUseFile(path));
        };

        let routes = Routes::default();
        let outcome = app_object(ctx, &routes)
            .and_then(|app| setup.call(&JsValue::undefined(), &[app.into()], ctx));
        self.jobs.drain(ctx);
        outcome.map_err(|err| script_error(err, &path, ctx))?;

        let mounted = std::mem::take(&mut *routes.borrow_mut());
        Ok(mounted)
    }

    /// Runs a mounted handler's synchronous phase as `handler(req, res, next)`.
    ///
    /// Calling `next` fires `proceed`. Returns the timeout to arm like
    /// [`run_script`](Self::run_script) does.
    pub fn run_handler(
        &self,
        route: &Route,
        request: &Rc<RequestContext>,
        script: &ScriptRequest,
        proceed: oneshot::Sender<()>,
        default_timeout: Option<Duration>,
    ) -> Result<Option<Duration>> {
        let mut context = self.context.borrow_mut();
        let ctx = &mut *context;
        let dir = script.file_path.parent().unwrap_or(Path::new("/"));

        let req = request_object(ctx, script, default_timeout)?;
        let outcome = call_handler(ctx, route.handler(), &req, request, dir, proceed);
        self.jobs.drain(ctx);

        if let Err(err) = outcome {
            return Err(script_error(err, &script.file_path, ctx));
        }
        if request.is_finished() {
            return Ok(None);
        }
        requested_timeout(&req, script, default_timeout, ctx)
    }

    /// Runs an expired timer's callback.
    ///
    /// An exception escaping a timer callback has no request to report to,
    /// so it is fatal to the worker.
    pub fn fire_timer(&self, id: TimerId) -> Result<()> {
        let Some((callback, args)) = self.timers.take_due(id) else {
            return Ok(());
        };

        let mut context = self.context.borrow_mut();
        let ctx = &mut *context;
        let outcome = callback.call(&JsValue::undefined(), &args, ctx);
        self.jobs.drain(ctx);

        match outcome {
            Ok(_) => Ok(()),
            Err(err) => {
                let message = describe(&err, ctx);
                Err(CgiError::WorkerFatal(format!(
                    "Uncaught exception in timer callback: {}",
                    message
                )))
            }
        }
    }

    /// Pumps timers and file change notifications.
    ///
    /// Must run on the worker's `LocalSet` for as long as the worker serves.
    /// Only returns on a fatal error.
    pub async fn drive(self: Rc<Self>, events: RuntimeEvents) -> CgiError {
        let RuntimeEvents { mut fired, changes } = events;
        if let Some(changes) = changes {
            tokio::task::spawn_local(run_invalidation(self.module_cache().clone(), changes));
        }

        while let Some(id) = fired.recv().await {
            if let Err(err) = self.fire_timer(id) {
                return err;
            }
        }
        CgiError::WorkerFatal("timer channel closed".into())
    }
}

fn call_handler(
    ctx: &mut Context,
    handler: &JsObject,
    req: &JsObject,
    request: &Rc<RequestContext>,
    dir: &Path,
    proceed: oneshot::Sender<()>,
) -> JsResult<JsValue> {
    let res = response_object(ctx, request, dir)?;
    let next = next_function(ctx, proceed);
    handler.call(
        &JsValue::undefined(),
        &[JsValue::from(req.clone()), JsValue::from(res), next],
        ctx,
    )
}

/// The deadline a script asked for through `req.timeout`.
///
/// `undefined`, `null` and NaN keep the default.
fn requested_timeout(
    req: &JsObject,
    script: &ScriptRequest,
    default_timeout: Option<Duration>,
    ctx: &mut Context,
) -> Result<Option<Duration>> {
    let timeout = req
        .get(js_string!("timeout"), ctx)
        .map_err(|err| script_error(err, &script.file_path, ctx))?;
    if timeout.is_undefined() || timeout.is_null() {
        return Ok(default_timeout);
    }
    let ms = timeout
        .to_number(ctx)
        .map_err(|err| script_error(err, &script.file_path, ctx))?;
    if ms.is_nan() {
        Ok(default_timeout)
    } else {
        Ok(timeout_from_ms(ms))
    }
}

/// Converts a thrown JS value into a script error carrying `{error, stack}`.
fn script_error(err: JsError, file: &Path, ctx: &mut Context) -> CgiError {
    let message = describe(&err, ctx);
    let thrown = err.to_opaque(ctx);

    let mut stack = None;
    if let Some(obj) = thrown.as_object() {
        if let Ok(value) = obj.get(js_string!("stack"), ctx) {
            if let Some(text) = value.as_string() {
                let text = text.to_std_string_escaped();
                if !text.is_empty() {
                    stack = Some(text);
                }
            }
        }
    }

    CgiError::Script {
        stack: stack.unwrap_or_else(|| format!("{}\n    at {}", message, file.display())),
        message,
    }
}

/// The string form of a thrown value, as `String(e)` would produce it.
fn describe(err: &JsError, ctx: &mut Context) -> String {
    let thrown = err.to_opaque(ctx);
    thrown
        .to_string(ctx)
        .map(|s| s.to_std_string_escaped())
        .unwrap_or_else(|_| err.to_string())
}

//! The `app` a use file configures
//!
//! A use file exports `function (app)`. Inside it:
//!
//! - `app.use([path,] fn)` mounts `fn` for every request under `path`, or
//!   for all requests when no path is given
//! - `app.all(path, fn)`, `app.get`, `app.post`, `app.put`, `app.delete`
//!   mount `fn` for that exact path (and method)
//!
//! Mounted handlers are called as `fn(req, res, next)`. Every mount method
//! returns `app`, so calls chain.

use std::cell::RefCell;
use std::rc::Rc;

use boa_engine::{
    js_string,
    native_function::NativeFunction,
    object::{FunctionObjectBuilder, JsObject},
    value::JsValue,
    Context, JsNativeError, JsResult,
};
use boa_gc::{Finalize, Trace};
use tokio::sync::oneshot;

/// A handler mounted by a use file.
pub struct Route {
    method: Option<&'static str>,
    path: Option<String>,
    prefix: bool,
    handler: JsObject,
}

impl Route {
    pub fn handler(&self) -> &JsObject {
        &self.handler
    }

    /// Whether a request for `path` with `method` reaches this handler.
    pub fn matches(&self, method: &str, path: &str) -> bool {
        if let Some(expected) = self.method {
            if !expected.eq_ignore_ascii_case(method) {
                return false;
            }
        }
        let Some(mount) = self.path.as_deref() else {
            return true;
        };
        if !self.prefix {
            return path == mount;
        }
        let mount = mount.trim_end_matches('/');
        mount.is_empty()
            || path == mount
            || path
                .strip_prefix(mount)
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

pub(crate) type Routes = Rc<RefCell<Vec<Route>>>;

/// `app` method name, the HTTP method it is limited to, and whether its path
/// is a prefix.
const MOUNTS: [(&str, Option<&str>, bool); 6] = [
    ("use", None, true),
    ("all", None, false),
    ("get", Some("GET"), false),
    ("post", Some("POST"), false),
    ("put", Some("PUT"), false),
    ("delete", Some("DELETE"), false),
];

#[derive(Trace, Finalize)]
struct AppCaptures {
    #[unsafe_ignore_trace]
    routes: Routes,
}

/// Builds the `app` object; mounted handlers are appended to `routes`.
pub(crate) fn app_object(ctx: &mut Context, routes: &Routes) -> JsResult<JsObject> {
    let app = JsObject::with_object_proto(ctx.intrinsics());

    for (name, method, prefix) in MOUNTS {
        let function = NativeFunction::from_copy_closure_with_captures(
            move |this, args, captures: &AppCaptures, ctx| {
                let (path, handler) = if args.len() >= 2 {
                    (Some(args[0].to_string(ctx)?.to_std_string_escaped()), args.get(1))
                } else {
                    (None, args.first())
                };
                if path.is_none() && !prefix {
                    return Err(JsNativeError::typ()
                        .with_message(format!("app.{}: path is required", name))
                        .into());
                }
                let handler = handler
                    .and_then(|value| value.as_object().map(|obj| obj.clone()))
                    .filter(|obj| obj.is_callable())
                    .ok_or_else(|| {
                        JsNativeError::typ().with_message(format!("app.{}: handler must be a function", name))
                    })?;

                captures.routes.borrow_mut().push(Route {
                    method,
                    path,
                    prefix,
                    handler,
                });
                Ok(this.clone())
            },
            AppCaptures {
                routes: routes.clone(),
            },
        );
        let function = FunctionObjectBuilder::new(ctx.realm(), function)
            .name(js_string!(name))
            .length(2)
            .build();
        app.set(js_string!(name), function, false, ctx)?;
    }

    Ok(app)
}

#[derive(Trace, Finalize)]
struct NextCaptures {
    #[unsafe_ignore_trace]
    proceed: Rc<RefCell<Option<oneshot::Sender<()>>>>,
}

/// Builds a handler's `next`. The first call fires `proceed`; later calls do nothing.
pub(crate) fn next_function(ctx: &mut Context, proceed: oneshot::Sender<()>) -> JsValue {
    let function = NativeFunction::from_copy_closure_with_captures(
        |_this, _args, captures: &NextCaptures, _ctx| {
            if let Some(proceed) = captures.proceed.borrow_mut().take() {
                let _ = proceed.send(());
            }
            Ok(JsValue::undefined())
        },
        NextCaptures {
            proceed: Rc::new(RefCell::new(Some(proceed))),
        },
    );

    FunctionObjectBuilder::new(ctx.realm(), function)
        .name(js_string!("next"))
        .length(0)
        .build()
        .into()
}

//! `req` and `res` objects
//!
//! `req` is plain data built fresh for every request. `res` is a set of
//! native functions closing over the request's [`RequestContext`]:
//!
//! | method | effect |
//! |--------|--------|
//! | `status(code)` | sets the status, chainable |
//! | `set(name, value)` / `setHeader` | sets a header, chainable |
//! | `get(name)` / `getHeader` | reads a header set so far |
//! | `send(body)` | responds: strings as html, Buffers as bytes, other values as JSON |
//! | `json(value)` | responds with JSON |
//! | `sendStatus(code)` | responds with the status' reason phrase |
//! | `sendFile(path)` | responds with a file's contents |
//! | `end(body?)` | responds with an optional body |
//! | `headersSent` | true once any of the above responded |

use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use boa_engine::{
    js_string,
    native_function::NativeFunction,
    object::{FunctionObjectBuilder, JsObject},
    property::PropertyDescriptor,
    value::JsValue,
    Context, JsNativeError, JsResult,
};
use boa_gc::{Finalize, Trace};
use hyper::StatusCode;
use jscgi_common::{CgiError, ExecutionResult, Result};
use serde_json::{Map, Value as JsonValue};

use crate::executor::{RequestContext, ScriptRequest};
use crate::runtime::bindings::buffer_bytes;
use crate::runtime::conversions::{json_to_js_value, stringify};

const HTML: &str = "text/html; charset=utf-8";
const JSON: &str = "application/json; charset=utf-8";

/// Builds the `req` object. `timeout` is the configured default in effect.
pub(crate) fn request_object(
    ctx: &mut Context,
    request: &ScriptRequest,
    timeout: Option<Duration>,
) -> Result<JsObject> {
    let mut data = Map::new();
    data.insert("method".into(), request.method.clone().into());
    data.insert("url".into(), request.url.clone().into());
    data.insert("originalUrl".into(), request.url.clone().into());
    data.insert("path".into(), request.path.clone().into());
    data.insert("query".into(), pairs_to_object(&request.query, PairMerge::Array));
    data.insert("headers".into(), pairs_to_object(&request.headers, PairMerge::Join));
    data.insert("body".into(), request.body.clone().into());
    data.insert("ip".into(), request.ip.to_string().into());
    data.insert("filePath".into(), request.file_path.display().to_string().into());
    data.insert(
        "documentRoot".into(),
        request.document_root.display().to_string().into(),
    );
    let timeout_ms = timeout.map(|t| t.as_millis() as u64).unwrap_or(0);
    data.insert("timeout".into(), timeout_ms.into());

    let req = json_to_js_value(JsonValue::Object(data), ctx)?
        .as_object()
        .map(|obj| obj.clone())
        .ok_or_else(|| CgiError::JavaScriptExecution("req is not an object".into()))?;

    let get = FunctionObjectBuilder::new(ctx.realm(), NativeFunction::from_fn_ptr(request_header))
        .name(js_string!("get"))
        .length(1)
        .build();
    req.set(js_string!("get"), get, false, ctx)
        .map_err(|e| CgiError::JavaScriptExecution(e.to_string()))?;

    Ok(req)
}

#[derive(Clone, Copy)]
enum PairMerge {
    /// Repeated keys collect into an array (query strings)
    Array,
    /// Repeated keys are joined with ", " (headers)
    Join,
}

fn pairs_to_object(pairs: &[(String, String)], merge: PairMerge) -> JsonValue {
    let mut map = Map::new();
    for (key, value) in pairs {
        if let Some(existing) = map.get_mut(key) {
            match (existing, merge) {
                (JsonValue::Array(items), PairMerge::Array) => {
                    items.push(JsonValue::String(value.clone()));
                }
                (existing, PairMerge::Array) => {
                    let first = existing.take();
                    *existing = JsonValue::Array(vec![first, JsonValue::String(value.clone())]);
                }
                (JsonValue::String(existing), PairMerge::Join) => {
                    existing.push_str(", ");
                    existing.push_str(value);
                }
                (_, PairMerge::Join) => {}
            }
            continue;
        }
        map.insert(key.clone(), JsonValue::String(value.clone()));
    }
    JsonValue::Object(map)
}

/// `req.get(name)`: case-insensitive header lookup.
fn request_header(this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let Some(req) = this.as_object() else {
        return Ok(JsValue::undefined());
    };
    let name = match args.first() {
        Some(name) => name.to_string(ctx)?.to_std_string_escaped().to_ascii_lowercase(),
        None => return Ok(JsValue::undefined()),
    };
    let headers = req.get(js_string!("headers"), ctx)?;
    match headers.as_object() {
        Some(headers) => headers.get(js_string!(name), ctx),
        None => Ok(JsValue::undefined()),
    }
}

/// Builds the `res` object bound to `request`.
///
/// Relative `sendFile` paths resolve against `script_dir`.
pub(crate) fn response_object(
    ctx: &mut Context,
    request: &Rc<RequestContext>,
    script_dir: &Path,
) -> JsResult<JsObject> {
    let res = JsObject::with_object_proto(ctx.intrinsics());
    let captures = ResponseCaptures {
        request: request.clone(),
        script_dir: script_dir.to_path_buf(),
    };

    method(ctx, &res, &captures, "status", 1, |captures, this, args, ctx| {
        captures.request.set_status(status_arg(args.first(), ctx)?);
        Ok(this.clone())
    })?;

    let set_header: Method = |captures, this, args, ctx| {
        let name = string_arg(args.first(), ctx)?;
        let value = string_arg(args.get(1), ctx)?;
        if name.is_empty() {
            return Err(JsNativeError::typ().with_message("header name is required").into());
        }
        captures.request.set_header(&name, value);
        Ok(this.clone())
    };
    method(ctx, &res, &captures, "set", 2, set_header)?;
    method(ctx, &res, &captures, "setHeader", 2, set_header)?;

    let get_header: Method = |captures, _this, args, ctx| {
        let name = string_arg(args.first(), ctx)?;
        Ok(captures
            .request
            .header(&name)
            .map(|value| JsValue::new(js_string!(value)))
            .unwrap_or_default())
    };
    method(ctx, &res, &captures, "get", 1, get_header)?;
    method(ctx, &res, &captures, "getHeader", 1, get_header)?;

    method(ctx, &res, &captures, "send", 1, |captures, this, args, ctx| {
        let body = args.first().cloned().unwrap_or_default();
        let (bytes, content_type) = body_bytes(&body, ctx)?;
        respond_with(&captures.request, bytes, content_type);
        Ok(this.clone())
    })?;

    method(ctx, &res, &captures, "json", 1, |captures, this, args, ctx| {
        let body = args.first().cloned().unwrap_or_default();
        let bytes = json_bytes(&body, ctx)?;
        captures.request.set_header("content-type", JSON);
        respond_with(&captures.request, bytes, None);
        Ok(this.clone())
    })?;

    method(ctx, &res, &captures, "sendStatus", 1, |captures, this, args, ctx| {
        let status = status_arg(args.first(), ctx)?;
        captures.request.set_status(status);
        let reason = StatusCode::from_u16(status)
            .ok()
            .and_then(|code| code.canonical_reason())
            .map(str::to_string)
            .unwrap_or_else(|| status.to_string());
        respond_with(&captures.request, reason.into_bytes(), Some("text/plain; charset=utf-8"));
        Ok(this.clone())
    })?;

    method(ctx, &res, &captures, "end", 1, |captures, this, args, ctx| {
        let body = args.first().cloned().unwrap_or_default();
        let (bytes, _) = body_bytes(&body, ctx)?;
        respond_with(&captures.request, bytes, None);
        Ok(this.clone())
    })?;

    method(ctx, &res, &captures, "sendFile", 1, |captures, this, args, ctx| {
        let target = string_arg(args.first(), ctx)?;
        if target.is_empty() {
            return Err(JsNativeError::typ().with_message("sendFile: path is required").into());
        }
        send_file(&captures.request, captures.script_dir.join(target));
        Ok(this.clone())
    })?;

    let headers_sent = NativeFunction::from_copy_closure_with_captures(
        |_this, _args, captures: &ResponseCaptures, _ctx| {
            Ok(JsValue::new(captures.request.is_finished()))
        },
        captures,
    );
    let getter = FunctionObjectBuilder::new(ctx.realm(), headers_sent)
        .name(js_string!("headersSent"))
        .build();
    res.define_property_or_throw(
        js_string!("headersSent"),
        PropertyDescriptor::builder()
            .get(getter)
            .enumerable(true)
            .configurable(true)
            .build(),
        ctx,
    )?;

    Ok(res)
}

/// What every `res` method closes over.
#[derive(Clone, Trace, Finalize)]
struct ResponseCaptures {
    #[unsafe_ignore_trace]
    request: Rc<RequestContext>,
    /// Base for relative `sendFile` paths
    #[unsafe_ignore_trace]
    script_dir: PathBuf,
}

type Method = fn(&ResponseCaptures, &JsValue, &[JsValue], &mut Context) -> JsResult<JsValue>;

/// Installs a native method on `res`.
fn method(
    ctx: &mut Context,
    res: &JsObject,
    captures: &ResponseCaptures,
    name: &'static str,
    length: usize,
    body: Method,
) -> JsResult<()> {
    let function = NativeFunction::from_copy_closure_with_captures(
        move |this, args, captures: &ResponseCaptures, ctx| body(captures, this, args, ctx),
        captures.clone(),
    );
    let function = FunctionObjectBuilder::new(ctx.realm(), function)
        .name(js_string!(name))
        .length(length)
        .build();
    res.set(js_string!(name), function, false, ctx)?;
    Ok(())
}

/// Finalizes the request with the status and headers set so far.
///
/// `default_type` applies only when the script set no content type itself.
fn respond_with(request: &RequestContext, bytes: Vec<u8>, default_type: Option<&str>) {
    if !request.finish() {
        return;
    }
    if let Some(content_type) = default_type {
        if request.header("content-type").is_none() {
            request.set_header("content-type", content_type);
        }
    }
    let result = ExecutionResult::output(request.status(), request.take_headers(), bytes);
    request.deliver(result);
}

fn send_file(request: &Rc<RequestContext>, path: PathBuf) {
    if !request.finish() {
        return;
    }
    let request = request.clone();
    tokio::task::spawn_local(async move {
        let result = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                if request.header("content-type").is_none() {
                    request.set_header("content-type", content_type_for(&path));
                }
                ExecutionResult::output(request.status(), request.take_headers(), bytes)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                CgiError::NotFound(path).into_result()
            }
            Err(source) => {
                let err = CgiError::Read { path, source };
                tracing::error!("{}", err);
                err.into_result()
            }
        };
        request.deliver(result);
    });
}

/// Converts a `send` argument into bytes plus the content type it implies.
fn body_bytes(body: &JsValue, ctx: &mut Context) -> JsResult<(Vec<u8>, Option<&'static str>)> {
    if body.is_undefined() || body.is_null() {
        return Ok((Vec::new(), None));
    }
    if let Some(text) = body.as_string() {
        return Ok((text.to_std_string_escaped().into_bytes(), Some(HTML)));
    }
    if let Some(obj) = body.as_object() {
        if !obj.is_callable() {
            if let Some(bytes) = buffer_bytes(&obj, ctx)? {
                return Ok((bytes, Some("application/octet-stream")));
            }
            return Ok((json_bytes(body, ctx)?, Some(JSON)));
        }
    }
    let text = body.to_string(ctx)?.to_std_string_escaped();
    Ok((text.into_bytes(), Some(HTML)))
}

/// `JSON.stringify` output as bytes; empty when there is nothing to encode.
fn json_bytes(value: &JsValue, ctx: &mut Context) -> JsResult<Vec<u8>> {
    Ok(stringify(value, ctx)?.map(String::into_bytes).unwrap_or_default())
}

fn status_arg(value: Option<&JsValue>, ctx: &mut Context) -> JsResult<u16> {
    let code = match value {
        Some(value) => value.to_number(ctx)?,
        None => f64::NAN,
    };
    if code.fract() == 0.0 && (100.0..=999.0).contains(&code) {
        Ok(code as u16)
    } else {
        Err(JsNativeError::range()
            .with_message(format!("Invalid status code: {}", code))
            .into())
    }
}

fn string_arg(value: Option<&JsValue>, ctx: &mut Context) -> JsResult<String> {
    match value {
        Some(value) if !value.is_undefined() => Ok(value.to_string(ctx)?.to_std_string_escaped()),
        _ => Ok(String::new()),
    }
}

fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("html") | Some("htm") => HTML,
        Some("js") | Some("mjs") => "application/javascript; charset=utf-8",
        Some("json") => JSON,
        Some("css") => "text/css; charset=utf-8",
        Some("txt") => "text/plain; charset=utf-8",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("ico") => "image/x-icon",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_pairs_collect_repeats() {
        let pairs = vec![
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
            ("a".to_string(), "3".to_string()),
            ("a".to_string(), "4".to_string()),
        ];
        assert_eq!(
            pairs_to_object(&pairs, PairMerge::Array),
            serde_json::json!({"a": ["1", "3", "4"], "b": "2"})
        );
    }

    #[test]
    fn test_header_pairs_join_repeats() {
        let pairs = vec![
            ("accept".to_string(), "text/html".to_string()),
            ("accept".to_string(), "application/json".to_string()),
        ];
        assert_eq!(
            pairs_to_object(&pairs, PairMerge::Join),
            serde_json::json!({"accept": "text/html, application/json"})
        );
    }

    #[test]
    fn test_status_arg_bounds() {
        let mut ctx = Context::default();
        assert_eq!(status_arg(Some(&JsValue::new(404)), &mut ctx).unwrap(), 404);
        assert!(status_arg(Some(&JsValue::new(42)), &mut ctx).is_err());
        assert!(status_arg(Some(&JsValue::new(200.5)), &mut ctx).is_err());
        assert!(status_arg(None, &mut ctx).is_err());
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for(Path::new("/a/index.HTML")), HTML);
        assert_eq!(content_type_for(Path::new("/a/logo.png")), "image/png");
        assert_eq!(content_type_for(Path::new("/a/blob")), "application/octet-stream");
    }
}

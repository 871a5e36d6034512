//! Capabilities handed to scripts
//!
//! Scripts see no ambient globals beyond the language built-ins. Everything
//! else arrives as a parameter of the function wrapper each script and module
//! is compiled into:
//!
//! - `console` - `log`/`info`/`debug`/`warn`/`error`, routed to the worker log
//! - `setTimeout`, `clearTimeout`, `setInterval`, `clearInterval`, `setImmediate`
//! - `Buffer` - a small byte container with utf8/base64/hex/latin1 transcoding
//!
//! `require`, `req` and `res` are per-file and per-request, and are built
//! elsewhere.

use std::rc::Rc;
use std::time::Duration;

use base64::Engine;
use boa_engine::{
    js_string,
    native_function::NativeFunction,
    object::{FunctionObjectBuilder, JsObject, ObjectInitializer},
    value::JsValue,
    Context, JsNativeError, JsResult, Source,
};
use boa_gc::{Finalize, Trace};
use jscgi_common::{CgiError, Result};

use crate::runtime::conversions::stringify;
use crate::runtime::timers::{TimerId, TimerQueue};

/// Parameter names the capabilities are bound to, in [`Capabilities::values`] order.
pub const CAPABILITY_PARAMS: &str =
    "console, setTimeout, clearTimeout, setInterval, clearInterval, setImmediate, Buffer";

/// Property holding a Buffer's bytes, base64 encoded.
const BUFFER_DATA: &str = "_b64";

const BUFFER_PRELUDE: &str = r#"
(function (transcode, byteLength) {
  function Buffer(data) {
    this._b64 = data;
    this.length = byteLength(data, 'base64');
  }
  Buffer.from = function (value, encoding) {
    if (value instanceof Buffer) {
      return new Buffer(value._b64);
    }
    if (Array.isArray(value)) {
      var text = '';
      for (var i = 0; i < value.length; i++) {
        text += String.fromCharCode(value[i] & 0xff);
      }
      return new Buffer(transcode(text, 'latin1', 'base64'));
    }
    return new Buffer(transcode(String(value), encoding || 'utf8', 'base64'));
  };
  Buffer.alloc = function (size) {
    var text = '';
    for (var i = 0; i < size; i++) {
      text += '\u0000';
    }
    return new Buffer(transcode(text, 'latin1', 'base64'));
  };
  Buffer.byteLength = function (value, encoding) {
    if (value instanceof Buffer) {
      return value.length;
    }
    return byteLength(String(value), encoding || 'utf8');
  };
  Buffer.isBuffer = function (value) {
    return value instanceof Buffer;
  };
  Buffer.concat = function (list) {
    var text = '';
    for (var i = 0; i < list.length; i++) {
      text += transcode(list[i]._b64, 'base64', 'latin1');
    }
    return new Buffer(transcode(text, 'latin1', 'base64'));
  };
  Buffer.prototype.toString = function (encoding) {
    return transcode(this._b64, 'base64', encoding || 'utf8');
  };
  Buffer.prototype.toJSON = function () {
    var bytes = transcode(this._b64, 'base64', 'latin1');
    var data = [];
    for (var i = 0; i < bytes.length; i++) {
      data.push(bytes.charCodeAt(i));
    }
    return { type: 'Buffer', data: data };
  };
  return Buffer;
})
"#;

/// The shared capability values, created once per worker.
#[derive(Clone)]
pub struct Capabilities {
    console: JsValue,
    set_timeout: JsValue,
    clear_timeout: JsValue,
    set_interval: JsValue,
    clear_interval: JsValue,
    set_immediate: JsValue,
    buffer: JsValue,
}

impl Capabilities {
    pub fn install(ctx: &mut Context, timers: &Rc<TimerQueue>) -> Result<Self> {
        Ok(Self {
            console: console_object(ctx).into(),
            set_timeout: timer_function(ctx, timers, "setTimeout", TimerMode::Timeout),
            clear_timeout: clear_function(ctx, timers, "clearTimeout"),
            set_interval: timer_function(ctx, timers, "setInterval", TimerMode::Interval),
            clear_interval: clear_function(ctx, timers, "clearInterval"),
            set_immediate: timer_function(ctx, timers, "setImmediate", TimerMode::Immediate),
            buffer: buffer_constructor(ctx)?,
        })
    }

    pub fn values(&self) -> [JsValue; 7] {
        [
            self.console.clone(),
            self.set_timeout.clone(),
            self.clear_timeout.clone(),
            self.set_interval.clone(),
            self.clear_interval.clone(),
            self.set_immediate.clone(),
            self.buffer.clone(),
        ]
    }
}

// ============================================================================
// console
// ============================================================================

fn console_object(ctx: &mut Context) -> JsObject {
    ObjectInitializer::new(ctx)
        .function(NativeFunction::from_fn_ptr(console_log), js_string!("log"), 0)
        .function(NativeFunction::from_fn_ptr(console_log), js_string!("info"), 0)
        .function(NativeFunction::from_fn_ptr(console_debug), js_string!("debug"), 0)
        .function(NativeFunction::from_fn_ptr(console_warn), js_string!("warn"), 0)
        .function(NativeFunction::from_fn_ptr(console_error), js_string!("error"), 0)
        .build()
}

fn console_log(_: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    tracing::info!(target: "script", "{}", format_console_args(args, ctx));
    Ok(JsValue::undefined())
}

fn console_debug(_: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    tracing::debug!(target: "script", "{}", format_console_args(args, ctx));
    Ok(JsValue::undefined())
}

fn console_warn(_: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    tracing::warn!(target: "script", "{}", format_console_args(args, ctx));
    Ok(JsValue::undefined())
}

fn console_error(_: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    tracing::error!(target: "script", "{}", format_console_args(args, ctx));
    Ok(JsValue::undefined())
}

/// Joins console arguments with spaces. Errors print their stack, other
/// objects print as JSON.
pub(crate) fn format_console_args(args: &[JsValue], ctx: &mut Context) -> String {
    let mut parts = Vec::with_capacity(args.len());
    for arg in args {
        parts.push(format_console_value(arg, ctx));
    }
    parts.join(" ")
}

fn format_console_value(value: &JsValue, ctx: &mut Context) -> String {
    if let Some(obj) = value.as_object() {
        if !obj.is_callable() {
            if let Ok(stack) = obj.get(js_string!("stack"), ctx) {
                if let Some(stack) = stack.as_string() {
                    return stack.to_std_string_escaped();
                }
            }
            // Cycles throw and fall through to the plain string form
            if let Ok(Some(text)) = stringify(value, ctx) {
                return text;
            }
        }
    }
    value
        .to_string(ctx)
        .map(|s| s.to_std_string_escaped())
        .unwrap_or_else(|_| "[unprintable]".to_string())
}

// ============================================================================
// timers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerMode {
    Timeout,
    Interval,
    Immediate,
}

/// The timer queue, as captured by the timer functions.
#[derive(Trace, Finalize)]
struct TimerCaptures {
    #[unsafe_ignore_trace]
    timers: Rc<TimerQueue>,
}

fn timer_function(
    ctx: &mut Context,
    timers: &Rc<TimerQueue>,
    name: &'static str,
    mode: TimerMode,
) -> JsValue {
    let function = NativeFunction::from_copy_closure_with_captures(
        move |_this, args, captures: &TimerCaptures, ctx| {
            let callback = callable_arg(args, 0).ok_or_else(|| {
                JsNativeError::typ().with_message(format!("{}: callback must be a function", name))
            })?;

            let (delay, rest) = match mode {
                TimerMode::Immediate => (Duration::ZERO, args.get(1..)),
                TimerMode::Timeout | TimerMode::Interval => {
                    (delay_arg(args.get(1), ctx)?, args.get(2..))
                }
            };
            let rest = rest.map(|r| r.to_vec()).unwrap_or_default();

            let id = captures
                .timers
                .schedule(callback, rest, delay, mode == TimerMode::Interval);
            Ok(JsValue::new(id))
        },
        TimerCaptures {
            timers: timers.clone(),
        },
    );

    FunctionObjectBuilder::new(ctx.realm(), function)
        .name(js_string!(name))
        .length(2)
        .build()
        .into()
}

fn clear_function(ctx: &mut Context, timers: &Rc<TimerQueue>, name: &'static str) -> JsValue {
    let function = NativeFunction::from_copy_closure_with_captures(
        |_this, args, captures: &TimerCaptures, ctx| {
            if let Some(id) = args.first().filter(|v| !v.is_undefined() && !v.is_null()) {
                let id = id.to_number(ctx)?;
                if id.is_finite() && id >= 0.0 && id <= f64::from(TimerId::MAX) {
                    captures.timers.clear(id as TimerId);
                }
            }
            Ok(JsValue::undefined())
        },
        TimerCaptures {
            timers: timers.clone(),
        },
    );

    FunctionObjectBuilder::new(ctx.realm(), function)
        .name(js_string!(name))
        .length(1)
        .build()
        .into()
}

/// Returns argument `index` if it is a callable object.
pub(crate) fn callable_arg(args: &[JsValue], index: usize) -> Option<JsObject> {
    args.get(index)
        .and_then(|value| value.as_object().map(|obj| obj.clone()))
        .filter(|obj| obj.is_callable())
}

fn delay_arg(value: Option<&JsValue>, ctx: &mut Context) -> JsResult<Duration> {
    let Some(value) = value.filter(|v| !v.is_undefined()) else {
        return Ok(Duration::ZERO);
    };
    let ms = value.to_number(ctx)?;
    if ms.is_finite() && ms > 0.0 {
        Ok(Duration::from_millis(ms as u64))
    } else {
        Ok(Duration::ZERO)
    }
}

// ============================================================================
// Buffer
// ============================================================================

fn buffer_constructor(ctx: &mut Context) -> Result<JsValue> {
    let factory = ctx
        .eval(Source::from_bytes(BUFFER_PRELUDE))
        .map_err(|e| CgiError::JavaScriptExecution(format!("Buffer prelude: {}", e)))?;
    let factory = factory
        .as_object()
        .map(|obj| obj.clone())
        .filter(|obj| obj.is_callable())
        .ok_or_else(|| CgiError::JavaScriptExecution("Buffer prelude is not a function".into()))?;

    let transcode = FunctionObjectBuilder::new(ctx.realm(), NativeFunction::from_fn_ptr(buffer_transcode))
        .name(js_string!("transcode"))
        .length(3)
        .build();
    let byte_length = FunctionObjectBuilder::new(ctx.realm(), NativeFunction::from_fn_ptr(buffer_byte_length))
        .name(js_string!("byteLength"))
        .length(2)
        .build();

    factory
        .call(&JsValue::undefined(), &[transcode.into(), byte_length.into()], ctx)
        .map_err(|e| CgiError::JavaScriptExecution(format!("Buffer prelude: {}", e)))
}

fn buffer_transcode(_: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let text = string_arg(args, 0, ctx)?;
    let from = string_arg(args, 1, ctx)?;
    let to = string_arg(args, 2, ctx)?;

    let bytes = decode(&text, &from).map_err(|e| JsNativeError::typ().with_message(e))?;
    let out = encode(&bytes, &to).map_err(|e| JsNativeError::typ().with_message(e))?;
    Ok(JsValue::new(js_string!(out)))
}

fn buffer_byte_length(_: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let text = string_arg(args, 0, ctx)?;
    let encoding = string_arg(args, 1, ctx)?;
    let bytes = decode(&text, &encoding).map_err(|e| JsNativeError::typ().with_message(e))?;
    Ok(JsValue::new(bytes.len() as f64))
}

fn string_arg(args: &[JsValue], index: usize, ctx: &mut Context) -> JsResult<String> {
    match args.get(index) {
        Some(value) => Ok(value.to_string(ctx)?.to_std_string_escaped()),
        None => Ok(String::new()),
    }
}

/// Returns the bytes held by a `Buffer` instance, or `None` for any other object.
pub(crate) fn buffer_bytes(obj: &JsObject, ctx: &mut Context) -> JsResult<Option<Vec<u8>>> {
    let data = obj.get(js_string!(BUFFER_DATA), ctx)?;
    let Some(data) = data.as_string() else {
        return Ok(None);
    };
    let data = data.to_std_string_escaped();
    base64::engine::general_purpose::STANDARD
        .decode(data.as_bytes())
        .map(Some)
        .map_err(|e| JsNativeError::typ().with_message(format!("corrupt Buffer: {}", e)).into())
}

fn decode(text: &str, encoding: &str) -> std::result::Result<Vec<u8>, String> {
    match normalize_encoding(encoding)? {
        Encoding::Utf8 => Ok(text.as_bytes().to_vec()),
        // Padding is optional on input
        Encoding::Base64 => base64::engine::general_purpose::STANDARD_NO_PAD
            .decode(text.trim_end_matches('=').as_bytes())
            .map_err(|e| format!("invalid base64: {}", e)),
        Encoding::Hex => hex::decode(text).map_err(|e| format!("invalid hex: {}", e)),
        Encoding::Latin1 => Ok(text.chars().map(|c| (c as u32 & 0xff) as u8).collect()),
    }
}

fn encode(bytes: &[u8], encoding: &str) -> std::result::Result<String, String> {
    match normalize_encoding(encoding)? {
        Encoding::Utf8 => Ok(String::from_utf8_lossy(bytes).into_owned()),
        Encoding::Base64 => Ok(base64::engine::general_purpose::STANDARD.encode(bytes)),
        Encoding::Hex => Ok(hex::encode(bytes)),
        Encoding::Latin1 => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Utf8,
    Base64,
    Hex,
    Latin1,
}

fn normalize_encoding(encoding: &str) -> std::result::Result<Encoding, String> {
    match encoding.to_ascii_lowercase().as_str() {
        "" | "utf8" | "utf-8" => Ok(Encoding::Utf8),
        "base64" => Ok(Encoding::Base64),
        "hex" => Ok(Encoding::Hex),
        "latin1" | "binary" | "ascii" => Ok(Encoding::Latin1),
        other => Err(format!("Unknown encoding: {}", other)),
    }
}

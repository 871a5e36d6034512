//! JSON <-> JavaScript Value Conversions
//!
//! Bridges `serde_json::Value` and Boa's `JsValue`. Used to hand request
//! data (headers, query) to scripts and to load `.json` modules. The way
//! back (`res.json(...)`, console output) goes through [`stringify`].
//!
//! | JSON Type | JavaScript Type |
//! |-----------|-----------------|
//! | null | null |
//! | boolean | Boolean |
//! | number | Number |
//! | string | String |
//! | array | Array |
//! | object | Object |

use boa_engine::{
    js_string,
    object::{builtins::JsArray, JsObject},
    value::JsValue,
    Context, JsNativeError, JsResult,
};
use jscgi_common::{CgiError, Result};
use serde_json::Value as JsonValue;

/// Convert serde_json::Value to Boa JsValue.
pub fn json_to_js_value(json: JsonValue, ctx: &mut Context) -> Result<JsValue> {
    match json {
        JsonValue::Null => Ok(JsValue::null()),
        JsonValue::Bool(b) => Ok(JsValue::new(b)),
        JsonValue::Number(n) => n
            .as_f64()
            .map(JsValue::new)
            .ok_or_else(|| CgiError::JavaScriptExecution("Number out of range".into())),
        JsonValue::String(s) => Ok(JsValue::new(js_string!(s))),
        JsonValue::Array(arr) => {
            let js_array = JsArray::new(ctx);
            for (i, v) in arr.into_iter().enumerate() {
                let js_value = json_to_js_value(v, ctx)?;
                js_array.push(js_value, ctx).map_err(|e| {
                    CgiError::JavaScriptExecution(format!(
                        "Failed to push array element {}: {}",
                        i, e
                    ))
                })?;
            }
            Ok(js_array.into())
        }
        JsonValue::Object(obj) => {
            let js_obj = JsObject::with_object_proto(ctx.intrinsics());
            for (key, value) in obj {
                let js_value = json_to_js_value(value, ctx)?;
                js_obj
                    .create_data_property_or_throw(js_string!(key.as_str()), js_value, ctx)
                    .map_err(|e| {
                        CgiError::JavaScriptExecution(format!(
                            "Failed to set property '{}': {}",
                            key, e
                        ))
                    })?;
            }
            Ok(js_obj.into())
        }
    }
}

/// Serializes a value with the realm's own `JSON.stringify`.
///
/// `toJSON` hooks run and keys keep their insertion order. A cyclic value
/// throws a `TypeError`, which is returned to the caller. Values JSON has no
/// text for (`undefined`, functions, symbols) yield `None`.
pub fn stringify(value: &JsValue, ctx: &mut Context) -> JsResult<Option<String>> {
    let json = ctx.intrinsics().objects().json();
    let function = json
        .get(js_string!("stringify"), ctx)?
        .as_object()
        .map(|obj| obj.clone())
        .filter(|obj| obj.is_callable())
        .ok_or_else(|| JsNativeError::typ().with_message("JSON.stringify is not a function"))?;

    let text = function.call(&JsValue::from(json), std::slice::from_ref(value), ctx)?;
    Ok(text.as_string().map(|text| text.to_std_string_escaped()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use boa_engine::Source;
    use serde_json::json;

    #[test]
    fn test_json_object_becomes_js_object() {
        let mut ctx = Context::default();
        let value = json_to_js_value(json!({"name": "jscgi", "tags": ["a", "b"]}), &mut ctx).unwrap();
        ctx.register_global_property(
            js_string!("input"),
            value,
            boa_engine::property::Attribute::all(),
        )
        .unwrap();

        let result = ctx
            .eval(Source::from_bytes("input.name + ':' + input.tags.length"))
            .unwrap();
        assert_eq!(
            result.to_string(&mut ctx).unwrap().to_std_string_escaped(),
            "jscgi:2"
        );
    }

    fn stringified(ctx: &mut Context, source: &str) -> JsResult<Option<String>> {
        let value = ctx.eval(Source::from_bytes(source)).unwrap();
        stringify(&value, ctx)
    }

    #[test]
    fn test_stringify_follows_json_rules() {
        let mut ctx = Context::default();
        let text = stringified(
            &mut ctx,
            "({ zeta: 1, alpha: [1, NaN], when: new Date(0), skip: undefined, fn: function () {} })",
        )
        .unwrap();
        assert_eq!(
            text.as_deref(),
            Some(r#"{"zeta":1,"alpha":[1,null],"when":"1970-01-01T00:00:00.000Z"}"#)
        );

        assert_eq!(stringified(&mut ctx, "undefined").unwrap(), None);
        assert_eq!(stringified(&mut ctx, "'plain'").unwrap().as_deref(), Some(r#""plain""#));
    }

    #[test]
    fn test_stringify_cycle_is_type_error() {
        let mut ctx = Context::default();
        let err = stringified(&mut ctx, "var o = {}; o.self = o; o").unwrap_err();
        let thrown = err.to_opaque(&mut ctx);
        let name = thrown
            .to_string(&mut ctx)
            .unwrap()
            .to_std_string_escaped();
        assert!(name.starts_with("TypeError"), "{}", name);
    }
}

//! JSON <-> JavaScript value conversions
//!
//! Used wherever values cross the sandbox boundary:
//!
//! - request snapshots handed to handlers (`client`)
//! - handler results turned into response bodies
//! - namespaces copied from one application's sandbox into another's
//!
//! # Type Mapping
//!
//! | JSON Type | JavaScript Type |
//! |-----------|-----------------|
//! | null | null |
//! | boolean | Boolean |
//! | number | Number |
//! | string | String |
//! | array | Array |
//! | object | Object |
//!
//! # Limitations
//!
//! - Functions and symbols become `null`; symbol keys are skipped
//! - Non-finite numbers become `null`

use boa_engine::{
    js_string,
    object::{builtins::JsArray, JsObject},
    property::PropertyKey,
    value::JsValue,
    Context, JsNativeError, JsResult,
};
use serde_json::Value as JsonValue;

/// Nesting depth at which conversion gives up (cyclic structures).
const MAX_DEPTH: usize = 64;

/// Convert a `serde_json::Value` into a value of `ctx`'s realm.
pub fn json_to_js_value(json: &JsonValue, ctx: &mut Context) -> JsResult<JsValue> {
    match json {
        JsonValue::Null => Ok(JsValue::null()),
        JsonValue::Bool(b) => Ok(JsValue::new(*b)),
        JsonValue::Number(n) => n
            .as_f64()
            .map(JsValue::new)
            .ok_or_else(|| JsNativeError::range().with_message("Number out of range").into()),
        JsonValue::String(s) => Ok(JsValue::new(js_string!(s.as_str()))),
        JsonValue::Array(arr) => {
            let js_array = JsArray::new(ctx);
            for v in arr {
                let js_value = json_to_js_value(v, ctx)?;
                js_array.push(js_value, ctx)?;
            }
            Ok(js_array.into())
        }
        JsonValue::Object(obj) => {
            let js_obj = JsObject::with_object_proto(ctx.intrinsics());
            for (key, value) in obj {
                let js_value = json_to_js_value(value, ctx)?;
                js_obj.create_data_property_or_throw(js_string!(key.as_str()), js_value, ctx)?;
            }
            Ok(js_obj.into())
        }
    }
}

/// Convert a JavaScript value into a `serde_json::Value`.
///
/// # Conversion Rules
///
/// - `undefined`, `null`, functions and symbols → `null`
/// - arrays → arrays, element by element
/// - other objects → objects over their own string keys
///
/// # Errors
///
/// Fails when a property getter throws or the structure nests deeper than
/// the conversion limit.
pub fn js_value_to_json(value: &JsValue, ctx: &mut Context) -> JsResult<JsonValue> {
    to_json(value, ctx, 0)
}

fn to_json(value: &JsValue, ctx: &mut Context, depth: usize) -> JsResult<JsonValue> {
    if depth > MAX_DEPTH {
        return Err(JsNativeError::range()
            .with_message("Value nests too deeply to convert")
            .into());
    }

    if value.is_undefined() || value.is_null() || value.is_symbol() {
        return Ok(JsonValue::Null);
    }

    if let Some(b) = value.as_boolean() {
        return Ok(JsonValue::Bool(b));
    }

    if let Some(i) = value.as_i32() {
        return Ok(JsonValue::Number(i.into()));
    }

    if let Some(n) = value.as_number() {
        // 2^53: integral doubles below it are exact integers
        if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
            return Ok(JsonValue::Number((n as i64).into()));
        }
        return Ok(serde_json::Number::from_f64(n)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null));
    }

    if let Some(s) = value.as_string() {
        return Ok(JsonValue::String(s.to_std_string_escaped()));
    }

    let Some(obj) = value.as_object() else {
        return Ok(JsonValue::Null);
    };
    let obj = obj.clone();

    if obj.is_callable() {
        return Ok(JsonValue::Null);
    }

    if obj.is_array() {
        let array = JsArray::from_object(obj)?;
        let length: usize = array
            .length(ctx)?
            .try_into()
            .map_err(|_| JsNativeError::range().with_message("Array length overflow"))?;
        let mut result = Vec::with_capacity(length);
        for i in 0..length {
            let elem = array.get(i, ctx)?;
            result.push(to_json(&elem, ctx, depth + 1)?);
        }
        return Ok(JsonValue::Array(result));
    }

    let keys = obj.own_property_keys(ctx)?;
    let mut result = serde_json::Map::new();
    for key in keys {
        let key_str = match &key {
            PropertyKey::String(s) => s.to_std_string_escaped(),
            PropertyKey::Index(i) => i.get().to_string(),
            PropertyKey::Symbol(_) => continue,
        };
        let prop_value = obj.get(key, ctx)?;
        result.insert(key_str, to_json(&prop_value, ctx, depth + 1)?);
    }
    Ok(JsonValue::Object(result))
}

/// Renders a value the way `console.log` prints it: strings raw, objects as
/// JSON, everything else through `ToString`.
pub fn display_value(value: &JsValue, ctx: &mut Context) -> String {
    if let Some(s) = value.as_string() {
        return s.to_std_string_escaped();
    }
    if value.is_object() && !value.as_object().is_some_and(|o| o.is_callable()) {
        if let Ok(json) = js_value_to_json(value, ctx) {
            return json.to_string();
        }
    }
    value
        .to_string(ctx)
        .map(|s| s.to_std_string_escaped())
        .unwrap_or_else(|_| "[value]".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use boa_engine::Source;
    use serde_json::json;

    #[test]
    fn test_json_object_survives_round_trip() {
        let mut ctx = Context::default();
        let value = json!({"name": "shop", "ports": [80, 443], "nested": {"ok": true}});
        let js = json_to_js_value(&value, &mut ctx).unwrap();
        assert_eq!(js_value_to_json(&js, &mut ctx).unwrap(), value);
    }

    #[test]
    fn test_functions_become_null() {
        let mut ctx = Context::default();
        let js = ctx
            .eval(Source::from_bytes("({ f: () => 1, n: 2 })"))
            .unwrap();
        assert_eq!(js_value_to_json(&js, &mut ctx).unwrap(), json!({"f": null, "n": 2}));
    }

    #[test]
    fn test_cyclic_object_is_rejected() {
        let mut ctx = Context::default();
        let js = ctx
            .eval(Source::from_bytes("const a = {}; a.self = a; a"))
            .unwrap();
        assert!(js_value_to_json(&js, &mut ctx).is_err());
    }

    #[test]
    fn test_display_value() {
        let mut ctx = Context::default();
        let obj = ctx.eval(Source::from_bytes("({ a: 1 })")).unwrap();
        assert_eq!(display_value(&obj, &mut ctx), "{\"a\":1}");
        let s = ctx.eval(Source::from_bytes("'plain'")).unwrap();
        assert_eq!(display_value(&s, &mut ctx), "plain");
        assert_eq!(display_value(&JsValue::new(3), &mut ctx), "3");
        assert_eq!(display_value(&JsValue::undefined(), &mut ctx), "undefined");
    }
}

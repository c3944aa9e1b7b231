//! API modules exposed to applications under the `api` namespace
//!
//! Modules come from two registries:
//!
//! - a fixed registry built into every worker (`common`, `path`)
//! - a lazy registry whose modules are constructed only when an application
//!   asks for them (`os`, `query-string`, `fs`)
//!
//! `fs` is never the host filesystem: it is always bound to the application's
//! own root and refuses paths that climb out of it.

use std::path::{Component, Path, PathBuf};

use boa_engine::{
    js_string,
    object::{builtins::JsArray, JsObject, ObjectInitializer},
    property::Attribute,
    value::JsValue,
    Context, JsNativeError, JsResult, NativeFunction,
};

use crate::runtime::conversions::{js_value_to_json, json_to_js_value};

/// API modules installed when the sandbox section doesn't list any.
pub const DEFAULT_API: &[&str] = &["common", "path", "fs", "os", "query-string"];

/// Resolves `name` from the fixed registry, then from the lazy one.
///
/// `fs` resolves to the variant bound to `root`. Unknown names yield `None`.
pub fn resolve(name: &str, root: &Path, ctx: &mut Context) -> Option<JsObject> {
    if name == "fs" {
        return Some(sandboxed_fs(root, ctx));
    }
    fixed(name, ctx).or_else(|| require(name, ctx))
}

fn fixed(name: &str, ctx: &mut Context) -> Option<JsObject> {
    match name {
        "common" => Some(common(ctx)),
        "path" => Some(path(ctx)),
        _ => None,
    }
}

fn require(name: &str, ctx: &mut Context) -> Option<JsObject> {
    match name {
        "os" => Some(os(ctx)),
        "query-string" => Some(query_string(ctx)),
        _ => None,
    }
}

/// `query-string` → `queryString`
pub fn spinal_to_camel(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = false;
    for ch in name.chars() {
        if ch == '-' {
            upper = true;
        } else if upper {
            out.extend(ch.to_uppercase());
            upper = false;
        } else {
            out.push(ch);
        }
    }
    out
}

/// Parses `"1m 30s"`-style durations into milliseconds; numbers pass through.
pub fn duration_ms(value: &JsValue, ctx: &mut Context) -> JsResult<JsValue> {
    if let Some(n) = value.as_number() {
        return Ok(JsValue::new(n));
    }
    let text = value.to_string(ctx)?.to_std_string_escaped();
    let parsed = humantime::parse_duration(text.trim())
        .map_err(|e| JsNativeError::typ().with_message(format!("Invalid duration {:?}: {}", text, e)))?;
    Ok(JsValue::new(parsed.as_millis() as f64))
}

fn string_arg(args: &[JsValue], index: usize, ctx: &mut Context) -> JsResult<String> {
    match args.get(index) {
        Some(v) if !v.is_undefined() => Ok(v.to_string(ctx)?.to_std_string_escaped()),
        _ => Err(JsNativeError::typ()
            .with_message(format!("Argument {} must be a string", index + 1))
            .into()),
    }
}

fn string_value(s: impl AsRef<str>) -> JsValue {
    JsValue::new(js_string!(s.as_ref()))
}

// ============================================================================
// common
// ============================================================================

fn common(ctx: &mut Context) -> JsObject {
    ObjectInitializer::new(ctx)
        .function(
            NativeFunction::from_fn_ptr(|_, args, ctx| {
                duration_ms(args.first().unwrap_or(&JsValue::undefined()), ctx)
            }),
            js_string!("duration"),
            1,
        )
        .function(
            NativeFunction::from_fn_ptr(|_, args, ctx| {
                Ok(string_value(spinal_to_camel(&string_arg(args, 0, ctx)?)))
            }),
            js_string!("spinalToCamel"),
            1,
        )
        .function(
            NativeFunction::from_fn_ptr(|_, args, ctx| {
                let bytes = args.first().cloned().unwrap_or_default().to_number(ctx)?;
                Ok(string_value(bytes_to_size(bytes)))
            }),
            js_string!("bytesToSize"),
            1,
        )
        .build()
}

/// `1536` → `"2 KB"` (decimal units, rounded).
pub fn bytes_to_size(bytes: f64) -> String {
    const UNITS: [&str; 7] = ["", " KB", " MB", " GB", " TB", " PB", " EB"];
    if bytes < 1000.0 {
        return format!("{}", bytes.max(0.0) as u64);
    }
    let exp = ((bytes.log10() / 3.0).floor() as usize).min(UNITS.len() - 1);
    let value = (bytes / 1000f64.powi(exp as i32)).round();
    format!("{}{}", value, UNITS[exp])
}

// ============================================================================
// path
// ============================================================================

fn path(ctx: &mut Context) -> JsObject {
    ObjectInitializer::new(ctx)
        .function(
            NativeFunction::from_fn_ptr(|_, args, ctx| {
                let mut joined = PathBuf::new();
                for i in 0..args.len() {
                    joined.push(string_arg(args, i, ctx)?);
                }
                Ok(string_value(joined.to_string_lossy()))
            }),
            js_string!("join"),
            2,
        )
        .function(
            NativeFunction::from_fn_ptr(|_, args, ctx| {
                let p = string_arg(args, 0, ctx)?;
                let mut base = Path::new(&p)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                if let Some(ext) = args.get(1).filter(|v| !v.is_undefined()) {
                    let ext = ext.to_string(ctx)?.to_std_string_escaped();
                    if let Some(stripped) = base.strip_suffix(ext.as_str()) {
                        base = stripped.to_string();
                    }
                }
                Ok(string_value(base))
            }),
            js_string!("basename"),
            2,
        )
        .function(
            NativeFunction::from_fn_ptr(|_, args, ctx| {
                let p = string_arg(args, 0, ctx)?;
                let dir = Path::new(&p)
                    .parent()
                    .map(|d| d.to_string_lossy().into_owned())
                    .unwrap_or_else(|| ".".to_string());
                Ok(string_value(if dir.is_empty() { ".".to_string() } else { dir }))
            }),
            js_string!("dirname"),
            1,
        )
        .function(
            NativeFunction::from_fn_ptr(|_, args, ctx| {
                let p = string_arg(args, 0, ctx)?;
                let ext = Path::new(&p)
                    .extension()
                    .map(|e| format!(".{}", e.to_string_lossy()))
                    .unwrap_or_default();
                Ok(string_value(ext))
            }),
            js_string!("extname"),
            1,
        )
        .build()
}

// ============================================================================
// os
// ============================================================================

fn os(ctx: &mut Context) -> JsObject {
    ObjectInitializer::new(ctx)
        .function(
            NativeFunction::from_fn_ptr(|_, _, _| Ok(string_value(std::env::consts::OS))),
            js_string!("platform"),
            0,
        )
        .function(
            NativeFunction::from_fn_ptr(|_, _, _| Ok(string_value(std::env::consts::ARCH))),
            js_string!("arch"),
            0,
        )
        .function(
            NativeFunction::from_fn_ptr(|_, _, _| {
                let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
                Ok(JsValue::new(cpus as f64))
            }),
            js_string!("cpus"),
            0,
        )
        .property(js_string!("EOL"), string_value("\n"), Attribute::READONLY)
        .build()
}

// ============================================================================
// query-string
// ============================================================================

fn query_string(ctx: &mut Context) -> JsObject {
    ObjectInitializer::new(ctx)
        .function(
            NativeFunction::from_fn_ptr(|_, args, ctx| {
                let raw = string_arg(args, 0, ctx)?;
                let parsed = parse_query(&raw);
                json_to_js_value(&parsed, ctx)
            }),
            js_string!("parse"),
            1,
        )
        .function(
            NativeFunction::from_fn_ptr(|_, args, ctx| {
                let value = args.first().cloned().unwrap_or_default();
                let json = js_value_to_json(&value, ctx)?;
                let pairs: Vec<(String, String)> = json
                    .as_object()
                    .map(|m| {
                        m.iter()
                            .map(|(k, v)| {
                                let v = match v {
                                    serde_json::Value::String(s) => s.clone(),
                                    other => other.to_string(),
                                };
                                (k.clone(), v)
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                let encoded = serde_urlencoded::to_string(pairs)
                    .map_err(|e| JsNativeError::typ().with_message(e.to_string()))?;
                Ok(string_value(encoded))
            }),
            js_string!("stringify"),
            1,
        )
        .build()
}

/// Parses `a=1&b=2&b=3` into `{"a": "1", "b": ["2", "3"]}`.
pub fn parse_query(raw: &str) -> serde_json::Value {
    let pairs: Vec<(String, String)> =
        serde_urlencoded::from_str(raw.trim_start_matches('?')).unwrap_or_default();
    let mut map = serde_json::Map::new();
    for (key, value) in pairs {
        match map.get_mut(&key) {
            Some(serde_json::Value::Array(values)) => values.push(value.into()),
            Some(existing) => {
                let first = existing.take();
                *existing = serde_json::Value::Array(vec![first, value.into()]);
            }
            None => {
                map.insert(key, value.into());
            }
        }
    }
    serde_json::Value::Object(map)
}

// ============================================================================
// fs (bound to the application root)
// ============================================================================

/// Resolves `requested` inside `root`, rejecting paths that climb above it.
///
/// Absolute paths are taken relative to the root.
pub fn resolve_in_root(root: &Path, requested: &str) -> Option<PathBuf> {
    let mut relative = PathBuf::new();
    for component in Path::new(requested).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::ParentDir => {
                if !relative.pop() {
                    return None;
                }
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    Some(root.join(relative))
}

fn fs_path(args: &[JsValue], root: &str, ctx: &mut Context) -> JsResult<PathBuf> {
    let requested = string_arg(args, 0, ctx)?;
    resolve_in_root(Path::new(root), &requested).ok_or_else(|| {
        JsNativeError::error()
            .with_message(format!("Access denied: {}", requested))
            .into()
    })
}

fn io_error(e: std::io::Error) -> boa_engine::JsError {
    JsNativeError::error().with_message(e.to_string()).into()
}

fn sandboxed_fs(root: &Path, ctx: &mut Context) -> JsObject {
    let root = root.to_string_lossy().into_owned();
    ObjectInitializer::new(ctx)
        .function(
            NativeFunction::from_copy_closure_with_captures(
                |_this: &JsValue, args: &[JsValue], root: &String, ctx: &mut Context| {
                    let path = fs_path(args, root, ctx)?;
                    let content = std::fs::read_to_string(path).map_err(io_error)?;
                    Ok(string_value(content))
                },
                root.clone(),
            ),
            js_string!("readFile"),
            1,
        )
        .function(
            NativeFunction::from_copy_closure_with_captures(
                |_this: &JsValue, args: &[JsValue], root: &String, ctx: &mut Context| {
                    let path = fs_path(args, root, ctx)?;
                    let data = string_arg(args, 1, ctx)?;
                    std::fs::write(path, data).map_err(io_error)?;
                    Ok(JsValue::undefined())
                },
                root.clone(),
            ),
            js_string!("writeFile"),
            2,
        )
        .function(
            NativeFunction::from_copy_closure_with_captures(
                |_this: &JsValue, args: &[JsValue], root: &String, ctx: &mut Context| {
                    let path = fs_path(args, root, ctx)?;
                    Ok(JsValue::new(path.exists()))
                },
                root.clone(),
            ),
            js_string!("exists"),
            1,
        )
        .function(
            NativeFunction::from_copy_closure_with_captures(
                |_this: &JsValue, args: &[JsValue], root: &String, ctx: &mut Context| {
                    let path = fs_path(args, root, ctx)?;
                    let mut names: Vec<String> = std::fs::read_dir(path)
                        .map_err(io_error)?
                        .flatten()
                        .map(|e| e.file_name().to_string_lossy().into_owned())
                        .collect();
                    names.sort();
                    let array = JsArray::new(ctx);
                    for name in names {
                        array.push(string_value(name), ctx)?;
                    }
                    Ok(array.into())
                },
                root.clone(),
            ),
            js_string!("readdir"),
            1,
        )
        .function(
            NativeFunction::from_copy_closure_with_captures(
                |_this: &JsValue, args: &[JsValue], root: &String, ctx: &mut Context| {
                    let path = fs_path(args, root, ctx)?;
                    let meta = std::fs::metadata(path).map_err(io_error)?;
                    let mtime = meta
                        .modified()
                        .ok()
                        .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
                        .map_or(0.0, |d| d.as_millis() as f64);
                    let stat = serde_json::json!({
                        "size": meta.len(),
                        "isFile": meta.is_file(),
                        "isDirectory": meta.is_dir(),
                        "mtime": mtime,
                    });
                    json_to_js_value(&stat, ctx)
                },
                root.clone(),
            ),
            js_string!("stat"),
            1,
        )
        .function(
            NativeFunction::from_copy_closure_with_captures(
                |_this: &JsValue, args: &[JsValue], root: &String, ctx: &mut Context| {
                    let path = fs_path(args, root, ctx)?;
                    std::fs::create_dir_all(path).map_err(io_error)?;
                    Ok(JsValue::undefined())
                },
                root.clone(),
            ),
            js_string!("mkdir"),
            1,
        )
        .function(
            NativeFunction::from_copy_closure_with_captures(
                |_this: &JsValue, args: &[JsValue], root: &String, ctx: &mut Context| {
                    let path = fs_path(args, root, ctx)?;
                    std::fs::remove_file(path).map_err(io_error)?;
                    Ok(JsValue::undefined())
                },
                root,
            ),
            js_string!("unlink"),
            1,
        )
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spinal_to_camel() {
        assert_eq!(spinal_to_camel("query-string"), "queryString");
        assert_eq!(spinal_to_camel("fs"), "fs");
        assert_eq!(spinal_to_camel("a-b-c"), "aBC");
    }

    #[test]
    fn test_resolve_in_root_rejects_traversal() {
        let root = Path::new("/srv/applications/shop");
        assert_eq!(
            resolve_in_root(root, "data/a.txt"),
            Some(PathBuf::from("/srv/applications/shop/data/a.txt"))
        );
        assert_eq!(
            resolve_in_root(root, "/etc/passwd"),
            Some(PathBuf::from("/srv/applications/shop/etc/passwd"))
        );
        assert_eq!(
            resolve_in_root(root, "data/../b.txt"),
            Some(PathBuf::from("/srv/applications/shop/b.txt"))
        );
        assert_eq!(resolve_in_root(root, "../billing/secret"), None);
        assert_eq!(resolve_in_root(root, "data/../../x"), None);
    }

    #[test]
    fn test_parse_query_collects_repeated_keys() {
        let parsed = parse_query("?a=1&b=2&b=3&c=hello+world");
        assert_eq!(
            parsed,
            serde_json::json!({"a": "1", "b": ["2", "3"], "c": "hello world"})
        );
    }

    #[test]
    fn test_bytes_to_size() {
        assert_eq!(bytes_to_size(512.0), "512");
        assert_eq!(bytes_to_size(1536.0), "2 KB");
        assert_eq!(bytes_to_size(3_200_000.0), "3 MB");
    }

    #[test]
    fn test_unknown_module_is_none() {
        let mut ctx = Context::default();
        let root = Path::new("/tmp");
        assert!(resolve("child-process", root, &mut ctx).is_none());
        assert!(resolve("os", root, &mut ctx).is_some());
        assert!(resolve("fs", root, &mut ctx).is_some());
    }
}

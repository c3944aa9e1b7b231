//! Per-application execution context
//!
//! A `Sandbox` owns one Boa `Context` and is owned by exactly one
//! `Application`. Its global object starts with:
//!
//! - `global`, a reference to the global object itself
//! - `application`, the route registration and long-worker API
//! - `console`, logging on target `app` tagged with the application name
//! - the allow-listed host built-ins (see [`globals`](crate::runtime::globals))
//! - `api`, the namespace of API modules
//!
//! Script execution is bounded: compilation gets a loop-iteration budget and a
//! wall-clock check of [`SCRIPT_PREPARE_TIMEOUT`], and panics inside the
//! engine are caught and reported as [`LoadError::Panic`].

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::time::Instant;

use apphost_common::config::SandboxSection;
use boa_engine::{
    js_string,
    object::{builtins::JsArray, JsObject},
    property::Attribute,
    value::JsValue,
    Context, JsError, JsResult, Source,
};
use serde_json::Value as JsonValue;

use crate::error::LoadError;
use crate::runtime::console::create_console;
use crate::runtime::conversions::{js_value_to_json, json_to_js_value};
use crate::runtime::globals::{create_host, DEFAULT_GLOBALS};
use crate::runtime::modules::{self, spinal_to_camel, DEFAULT_API};
use crate::runtime::script::{ScriptKind, ScriptScope, SCRIPT_PREPARE_TIMEOUT};

/// Loop iterations allowed while compiling one script.
const PREPARE_LOOP_LIMIT: u64 = 5_000_000;

/// Loop iterations allowed in one handler, timer tick or test run.
const EXECUTION_LOOP_LIMIT: u64 = 200_000_000;

/// A route registered from script code through `application.get(...)` and friends.
pub struct RouteRegistration {
    pub method: String,
    pub path: String,
    pub handler: JsValue,
}

/// A long-worker request made through `application.startWorker/stopWorker`.
#[derive(Debug, Clone, PartialEq)]
pub struct OffloadRequest {
    pub start: bool,
    /// JSON projection of the client object the script passed
    pub client: JsonValue,
    pub file: String,
}

/// Requests queued by script code since the last drain.
#[derive(Default)]
pub struct Drained {
    pub routes: Vec<RouteRegistration>,
    pub offloads: Vec<OffloadRequest>,
}

/// Response body produced by a handler.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerBody {
    Empty,
    /// Strings are sent as `text/html`
    Text(String),
    /// Everything else is sent as JSON
    Json(JsonValue),
}

/// Outcome of a handler once it has answered.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerOutput {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: HandlerBody,
}

/// Handle on a handler invocation that may complete later (callback, promise
/// or timer).
pub struct PendingCall {
    key: String,
    state: JsObject,
    client: JsObject,
}

pub struct Sandbox {
    ctx: Context,
    app_name: String,
    host: JsObject,
}

impl Sandbox {
    /// Builds the context for `app_name` rooted at `root`.
    ///
    /// Names on the allow-list that are not host built-ins, and API modules
    /// that cannot be resolved, are skipped. `require` is never installed.
    pub fn build(
        app_name: &str,
        root: &Path,
        config: Option<&SandboxSection>,
    ) -> Result<Self, LoadError> {
        let sandbox_err = |e: JsError| LoadError::Sandbox {
            app: app_name.to_string(),
            message: e.to_string(),
        };

        let mut ctx = Context::default();
        let host = create_host(&mut ctx).map_err(sandbox_err)?;

        let global = ctx.global_object();
        ctx.register_global_property(js_string!("global"), global, Attribute::all())
            .map_err(sandbox_err)?;

        let application = host
            .get(js_string!("application"), &mut ctx)
            .map_err(sandbox_err)?;
        if let Some(app_obj) = application.as_object() {
            app_obj
                .set(js_string!("name"), js_string!(app_name), false, &mut ctx)
                .map_err(sandbox_err)?;
            app_obj
                .set(
                    js_string!("dir"),
                    js_string!(root.to_string_lossy().as_ref()),
                    false,
                    &mut ctx,
                )
                .map_err(sandbox_err)?;
        }
        ctx.register_global_property(js_string!("application"), application, Attribute::all())
            .map_err(sandbox_err)?;

        let console = create_console(app_name, &mut ctx);
        ctx.register_global_property(js_string!("console"), console, Attribute::all())
            .map_err(sandbox_err)?;

        let globals: Vec<String> = config
            .and_then(|c| c.global.clone())
            .unwrap_or_else(|| DEFAULT_GLOBALS.iter().map(|s| s.to_string()).collect());
        for name in globals {
            if name == "require" || name.starts_with("__") {
                continue;
            }
            let value = host.get(js_string!(name.as_str()), &mut ctx).map_err(sandbox_err)?;
            if value.is_undefined() {
                tracing::debug!(app = %app_name, global = %name, "global is not available");
                continue;
            }
            ctx.register_global_property(js_string!(name.as_str()), value, Attribute::all())
                .map_err(sandbox_err)?;
        }

        let api = JsObject::with_object_proto(ctx.intrinsics());
        let apis: Vec<String> = config
            .and_then(|c| c.api.clone())
            .unwrap_or_else(|| DEFAULT_API.iter().map(|s| s.to_string()).collect());
        for name in apis {
            let Some(module) = modules::resolve(&name, root, &mut ctx) else {
                tracing::debug!(app = %app_name, module = %name, "api module is not available");
                continue;
            };
            api.set(js_string!(spinal_to_camel(&name).as_str()), module, false, &mut ctx)
                .map_err(sandbox_err)?;
        }
        ctx.register_global_property(js_string!("api"), api, Attribute::all())
            .map_err(sandbox_err)?;

        Ok(Self {
            ctx,
            app_name: app_name.to_string(),
            host,
        })
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Direct access to the engine, for callers that need more than the
    /// helpers below.
    pub fn context(&mut self) -> &mut Context {
        &mut self.ctx
    }

    /// Compiles and runs the source of `key` with its location's wrapper.
    ///
    /// Returns the completion value: the handler factory for `/api/` files,
    /// the test function for tests, the last expression value otherwise.
    ///
    /// # Limits
    ///
    /// Boa runs the script to completion on this thread, so a runaway script
    /// is stopped by the loop-iteration limit (`PREPARE_LOOP_LIMIT`), which
    /// is reported as [`LoadError::Timeout`]. The 500 ms prepare budget is
    /// only checked once evaluation returns; a script that finishes over it
    /// still fails with `Timeout`, but nothing interrupts it midway.
    pub fn load_unit(&mut self, key: &str, source: &str) -> Result<JsValue, LoadError> {
        let code = ScriptKind::for_key(key).wrap(source);
        let started = Instant::now();
        let result = self
            .guarded(key, PREPARE_LOOP_LIMIT, |ctx| {
                let value = ctx.eval(Source::from_bytes(code.as_bytes()))?;
                let _ = ctx.run_jobs();
                Ok(value)
            })
            .map_err(|e| match e {
                LoadError::Execution { key, message } => LoadError::Compile { key, message },
                other => other,
            })?;
        let elapsed = started.elapsed();
        if elapsed > SCRIPT_PREPARE_TIMEOUT {
            return Err(LoadError::Timeout {
                key: key.to_string(),
                elapsed,
            });
        }
        Ok(result)
    }

    /// Evaluates raw source in the global scope without any wrapper.
    pub fn eval(&mut self, source: &str) -> Result<JsValue, LoadError> {
        self.guarded("<eval>", EXECUTION_LOOP_LIMIT, |ctx| {
            ctx.eval(Source::from_bytes(source.as_bytes()))
        })
    }

    /// Calls `func` with `args` and an undefined receiver.
    pub fn call(&mut self, key: &str, func: &JsValue, args: &[JsValue]) -> Result<JsValue, LoadError> {
        let Some(callable) = func.as_callable().map(|f| f.clone()) else {
            return Err(LoadError::Execution {
                key: key.to_string(),
                message: "export is not a function".to_string(),
            });
        };
        self.guarded(key, EXECUTION_LOOP_LIMIT, |ctx| {
            callable.call(&JsValue::undefined(), args, ctx)
        })
    }

    /// Starts `handler(client, callback)` for the request described by `client`.
    pub fn invoke_handler(
        &mut self,
        key: &str,
        handler: &JsValue,
        client: &JsonValue,
    ) -> Result<PendingCall, LoadError> {
        let invoke = self.host_hook("__invoke")?;
        let client = self.convert_in(key, client)?;
        let client_obj = client.as_object().map(|o| o.clone()).ok_or_else(|| LoadError::Execution {
            key: key.to_string(),
            message: "client snapshot is not an object".to_string(),
        })?;
        let state = self.call(key, &invoke, &[handler.clone(), client])?;
        let state = state.as_object().map(|o| o.clone()).ok_or_else(|| LoadError::Execution {
            key: key.to_string(),
            message: "handler state is not an object".to_string(),
        })?;
        Ok(PendingCall {
            key: key.to_string(),
            state,
            client: client_obj,
        })
    }

    /// Runs queued promise jobs and reports whether `call` has answered.
    ///
    /// `Ok(None)` means the handler has neither returned a value nor called
    /// its callback yet.
    pub fn poll_handler(&mut self, call: &PendingCall) -> Result<Option<HandlerOutput>, LoadError> {
        let key = call.key.clone();
        let state = call.state.clone();
        let client = call.client.clone();
        self.guarded(&key, EXECUTION_LOOP_LIMIT, move |ctx| {
            let _ = ctx.run_jobs();
            let done = state.get(js_string!("done"), ctx)?.to_boolean();
            if !done {
                return Ok(None);
            }
            let error = state.get(js_string!("error"), ctx)?;
            if !error.is_undefined() {
                let message = error.to_string(ctx)?;
                return Err(boa_engine::JsNativeError::error().with_message(message.to_std_string_escaped()).into());
            }

            let status = client.get(js_string!("status"), ctx)?;
            let status = status
                .as_number()
                .filter(|n| (100.0..1000.0).contains(n))
                .map_or(200, |n| n as u16);
            let content_type = client
                .get(js_string!("contentType"), ctx)?
                .as_string()
                .map(|s| s.to_std_string_escaped());

            let value = state.get(js_string!("value"), ctx)?;
            let body = if value.is_undefined() || value.is_null() {
                HandlerBody::Empty
            } else if let Some(s) = value.as_string() {
                HandlerBody::Text(s.to_std_string_escaped())
            } else {
                HandlerBody::Json(js_value_to_json(&value, ctx)?)
            };
            Ok(Some(HandlerOutput {
                status,
                content_type,
                body,
            }))
        })
    }

    /// Fires due timers and runs pending jobs; returns the number of timers left.
    pub fn run_timers(&mut self) -> Result<usize, LoadError> {
        let run = self.host_hook("__runTimers")?;
        let left = self.call("<timers>", &run, &[])?;
        let _ = self.ctx.run_jobs();
        Ok(left.as_number().map_or(0, |n| n as usize))
    }

    /// Runs a test export against the built-in assertion object.
    ///
    /// Returns the failure messages; an empty list means the test passed.
    pub fn run_test(&mut self, key: &str, test: &JsValue) -> Result<Vec<String>, LoadError> {
        let run = self.host_hook("__runTest")?;
        let failures = self.call(key, &run, &[test.clone()])?;
        let json = self.convert_out(key, &failures)?;
        Ok(json
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .map(|v| v.as_str().map_or_else(|| v.to_string(), str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Takes every route registration and offload request queued by scripts.
    pub fn drain(&mut self) -> Result<Drained, LoadError> {
        let drain = self.host_hook("__drain")?;
        let queues = self.call("<drain>", &drain, &[])?;
        let ctx = &mut self.ctx;
        let key = "<drain>";
        let to_err = |e: JsError| LoadError::Execution {
            key: key.to_string(),
            message: e.to_string(),
        };

        let mut drained = Drained::default();
        let queues = array_items(&queues, ctx).map_err(to_err)?;
        let routes = match queues.first() {
            Some(v) => array_items(v, ctx).map_err(to_err)?,
            None => Vec::new(),
        };
        for route in routes {
            let parts = array_items(&route, ctx).map_err(to_err)?;
            if let [method, path, handler] = parts.as_slice() {
                drained.routes.push(RouteRegistration {
                    method: method.to_string(ctx).map_err(to_err)?.to_std_string_escaped(),
                    path: path.to_string(ctx).map_err(to_err)?.to_std_string_escaped(),
                    handler: handler.clone(),
                });
            }
        }

        let offloads = match queues.get(1) {
            Some(v) => array_items(v, ctx).map_err(to_err)?,
            None => Vec::new(),
        };
        for offload in offloads {
            let parts = array_items(&offload, ctx).map_err(to_err)?;
            if let [op, client, file] = parts.as_slice() {
                drained.offloads.push(OffloadRequest {
                    start: op.as_string().is_some_and(|s| s.to_std_string_escaped() == "start"),
                    client: js_value_to_json(client, ctx).map_err(to_err)?,
                    file: file.to_string(ctx).map_err(to_err)?.to_std_string_escaped(),
                });
            }
        }
        Ok(drained)
    }

    /// Reads global `name` as JSON. Missing names yield `None`.
    pub fn global_to_json(&mut self, name: &str) -> Result<Option<JsonValue>, LoadError> {
        let global = self.ctx.global_object();
        let value = global
            .get(js_string!(name), &mut self.ctx)
            .map_err(|e| self.execution_error(name, e))?;
        if value.is_undefined() {
            return Ok(None);
        }
        self.convert_out(name, &value).map(Some)
    }

    /// Stores `value` at a dotted path below the global object, creating
    /// intermediate objects as needed (`billing.rates` → `global.billing.rates`).
    pub fn set_by_path(&mut self, path: &str, value: &JsonValue) -> Result<(), LoadError> {
        let parts: Vec<&str> = path.split('.').filter(|p| !p.is_empty()).collect();
        let Some((last, parents)) = parts.split_last() else {
            return Err(LoadError::Execution {
                key: path.to_string(),
                message: "empty path".to_string(),
            });
        };
        let value = self.convert_in(path, value)?;
        let ctx = &mut self.ctx;
        let result: JsResult<()> = (|| {
            let mut target = ctx.global_object();
            for part in parents {
                let next = target.get(js_string!(*part), ctx)?;
                target = match next.as_object() {
                    Some(obj) => obj.clone(),
                    None => {
                        let created = JsObject::with_object_proto(ctx.intrinsics());
                        target.set(js_string!(*part), created.clone(), true, ctx)?;
                        created
                    }
                };
            }
            target.set(js_string!(*last), value, true, ctx)?;
            Ok(())
        })();
        result.map_err(|e| self.execution_error(path, e))
    }

    fn host_hook(&mut self, name: &str) -> Result<JsValue, LoadError> {
        self.host
            .get(js_string!(name), &mut self.ctx)
            .map_err(|e| self.execution_error(name, e))
    }

    fn convert_in(&mut self, key: &str, value: &JsonValue) -> Result<JsValue, LoadError> {
        json_to_js_value(value, &mut self.ctx).map_err(|e| self.execution_error(key, e))
    }

    fn convert_out(&mut self, key: &str, value: &JsValue) -> Result<JsonValue, LoadError> {
        js_value_to_json(value, &mut self.ctx).map_err(|e| self.execution_error(key, e))
    }

    fn execution_error(&self, key: &str, e: JsError) -> LoadError {
        LoadError::Execution {
            key: key.to_string(),
            message: e.to_string(),
        }
    }

    /// Runs `f` inside a script scope with a loop budget, converting thrown
    /// exceptions and engine panics into `LoadError`.
    fn guarded<T>(
        &mut self,
        key: &str,
        loop_limit: u64,
        f: impl FnOnce(&mut Context) -> JsResult<T>,
    ) -> Result<T, LoadError> {
        let _scope = ScriptScope::enter(&self.app_name);
        self.ctx.runtime_limits_mut().set_loop_iteration_limit(loop_limit);
        let ctx = &mut self.ctx;
        let outcome = catch_unwind(AssertUnwindSafe(|| f(ctx)));
        self.ctx.runtime_limits_mut().set_loop_iteration_limit(u64::MAX);

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                let message = e.to_string();
                if message.contains("iteration limit") {
                    Err(LoadError::Timeout {
                        key: key.to_string(),
                        elapsed: SCRIPT_PREPARE_TIMEOUT,
                    })
                } else {
                    Err(LoadError::Execution {
                        key: key.to_string(),
                        message,
                    })
                }
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(LoadError::Panic {
                    key: key.to_string(),
                    message,
                })
            }
        }
    }
}

fn array_items(value: &JsValue, ctx: &mut Context) -> JsResult<Vec<JsValue>> {
    let Some(obj) = value.as_object() else {
        return Ok(Vec::new());
    };
    let array = JsArray::from_object(obj.clone())?;
    let length = array.length(ctx)?;
    let mut items = Vec::new();
    for i in 0..length {
        items.push(array.get(i as u32, ctx)?);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sandbox() -> Sandbox {
        Sandbox::build("shop", Path::new("/srv/applications/shop"), None).unwrap()
    }

    fn eval_string(sandbox: &mut Sandbox, source: &str) -> String {
        let value = sandbox.eval(source).unwrap();
        value.to_string(sandbox.context()).unwrap().to_std_string_escaped()
    }

    #[test]
    fn test_default_bindings() {
        let mut sb = sandbox();
        assert_eq!(eval_string(&mut sb, "global === globalThis"), "true");
        assert_eq!(eval_string(&mut sb, "application.name"), "shop");
        assert_eq!(eval_string(&mut sb, "typeof console.log"), "function");
        assert_eq!(eval_string(&mut sb, "typeof setTimeout"), "function");
        assert_eq!(eval_string(&mut sb, "Duration('1m')"), "60000");
        assert_eq!(eval_string(&mut sb, "typeof api.queryString.parse"), "function");
        assert_eq!(eval_string(&mut sb, "typeof require"), "undefined");
        assert_eq!(eval_string(&mut sb, "typeof __invoke"), "undefined");
    }

    #[test]
    fn test_allow_list_skips_unknown_names() {
        let config = SandboxSection {
            global: Some(vec!["setTimeout".into(), "require".into(), "Nonexistent".into()]),
            api: Some(vec!["path".into(), "no-such-module".into()]),
            ..SandboxSection::default()
        };
        let mut sb = Sandbox::build("shop", Path::new("/tmp"), Some(&config)).unwrap();
        assert_eq!(eval_string(&mut sb, "typeof setTimeout"), "function");
        assert_eq!(eval_string(&mut sb, "typeof Buffer"), "undefined");
        assert_eq!(eval_string(&mut sb, "typeof Nonexistent"), "undefined");
        assert_eq!(eval_string(&mut sb, "Object.keys(api).join(',')"), "path");
    }

    #[test]
    fn test_sandboxes_are_isolated() {
        let mut a = sandbox();
        let mut b = Sandbox::build("billing", Path::new("/tmp"), None).unwrap();
        a.eval("global.secret = 42").unwrap();
        assert_eq!(eval_string(&mut b, "typeof secret"), "undefined");
    }

    #[test]
    fn test_load_unit_object_literal() {
        let mut sb = sandbox();
        let value = sb.load_unit("/lib/config.js", "{ name: 'shop', port: 80 }").unwrap();
        let json = js_value_to_json(&value, sb.context()).unwrap();
        assert_eq!(json, json!({"name": "shop", "port": 80}));
    }

    #[test]
    fn test_load_unit_api_factory() {
        let mut sb = sandbox();
        let factory = sb.load_unit("/api/math/add.js", "(a, b) => a + b;").unwrap();
        let conn = JsValue::undefined();
        let method = sb.call("/api/math/add.js", &factory, &[conn]).unwrap();
        let sum = sb
            .call("/api/math/add.js", &method, &[JsValue::new(2), JsValue::new(3)])
            .unwrap();
        assert_eq!(sum.as_number(), Some(5.0));
    }

    #[test]
    fn test_syntax_error_is_compile_error() {
        let mut sb = sandbox();
        let err = sb.load_unit("/lib/broken.js", "this is not ))").unwrap_err();
        assert!(matches!(err, LoadError::Compile { .. }));
        assert_eq!(err.key(), Some("/lib/broken.js"));
    }

    #[test]
    fn test_runaway_script_times_out() {
        let mut sb = sandbox();
        let err = sb.load_unit("/lib/spin.js", "while (true) {}").unwrap_err();
        assert!(matches!(err, LoadError::Timeout { .. }));
        // the limit is lifted again afterwards
        assert!(sb.eval("let n = 0; for (let i = 0; i < 10; i++) n++; n").is_ok());
    }

    #[test]
    fn test_handler_return_value_is_the_body() {
        let mut sb = sandbox();
        let handler = sb.load_unit("/www/get.js", "(client, callback) => 'hello ' + client.url").unwrap();
        let call = sb.invoke_handler("/www/get.js", &handler, &json!({"url": "/"})).unwrap();
        let output = sb.poll_handler(&call).unwrap().unwrap();
        assert_eq!(output.status, 200);
        assert_eq!(output.body, HandlerBody::Text("hello /".into()));
    }

    #[test]
    fn test_handler_callback_with_status() {
        let mut sb = sandbox();
        let handler = sb
            .load_unit(
                "/www/post.js",
                "(client, callback) => { client.status = 201; callback({ id: 7 }); }",
            )
            .unwrap();
        let call = sb.invoke_handler("/www/post.js", &handler, &json!({})).unwrap();
        let output = sb.poll_handler(&call).unwrap().unwrap();
        assert_eq!(output.status, 201);
        assert_eq!(output.body, HandlerBody::Json(json!({"id": 7})));
    }

    #[test]
    fn test_handler_answering_from_timer() {
        let mut sb = sandbox();
        let handler = sb
            .load_unit(
                "/www/get.js",
                "(client, callback) => { setTimeout(() => callback('late'), 0); }",
            )
            .unwrap();
        let call = sb.invoke_handler("/www/get.js", &handler, &json!({})).unwrap();
        assert_eq!(sb.poll_handler(&call).unwrap(), None);
        sb.run_timers().unwrap();
        let output = sb.poll_handler(&call).unwrap().unwrap();
        assert_eq!(output.body, HandlerBody::Text("late".into()));
    }

    #[test]
    fn test_throwing_handler_is_an_error() {
        let mut sb = sandbox();
        let handler = sb.load_unit("/www/get.js", "() => { throw new Error('boom'); }").unwrap();
        let err = sb.invoke_handler("/www/get.js", &handler, &json!({})).err().unwrap();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_drain_collects_routes_and_offloads() {
        let mut sb = sandbox();
        sb.eval(
            "application.get('/hello', () => 'hi');\n\
             application.startWorker({ url: '/cart', pathDir: '/www/cart/' }, 'long');",
        )
        .unwrap();
        let drained = sb.drain().unwrap();
        assert_eq!(drained.routes.len(), 1);
        assert_eq!(drained.routes[0].method, "get");
        assert_eq!(drained.routes[0].path, "/hello");
        assert_eq!(drained.offloads.len(), 1);
        assert!(drained.offloads[0].start);
        assert_eq!(drained.offloads[0].file, "long");
        assert_eq!(drained.offloads[0].client["url"], "/cart");
        assert!(sb.drain().unwrap().routes.is_empty());
    }

    #[test]
    fn test_set_by_path_creates_parents() {
        let mut sb = sandbox();
        sb.set_by_path("billing.rates", &json!({"vat": 20})).unwrap();
        assert_eq!(eval_string(&mut sb, "billing.rates.vat"), "20");
        assert_eq!(sb.global_to_json("billing").unwrap(), Some(json!({"rates": {"vat": 20}})));
        assert_eq!(sb.global_to_json("missing").unwrap(), None);
    }

    #[test]
    fn test_run_test_reports_failures() {
        let mut sb = sandbox();
        let test = sb
            .load_unit(
                "/lib/math.test.js",
                "test.strictEqual(1 + 1, 2); test.strictEqual(2 * 2, 5, 'multiply');",
            )
            .unwrap();
        let failures = sb.run_test("/lib/math.test.js", &test).unwrap();
        assert_eq!(failures, vec!["multiply".to_string()]);
    }
}

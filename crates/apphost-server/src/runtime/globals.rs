//! Host built-ins a sandbox may opt into
//!
//! The host object is evaluated once per sandbox and never exposed as a whole:
//! only the names on the sandbox's global allow-list are copied onto the
//! application's global object. Names starting with `__` are hooks the worker
//! calls from Rust (timer ticks, handler invocation, test runs, queue drains).

use boa_engine::{js_string, object::JsObject, value::JsValue, Context, JsResult, NativeFunction, Source};

use crate::runtime::conversions::json_to_js_value;
use crate::runtime::modules::duration_ms;

/// Globals installed when the sandbox section doesn't list any.
pub const DEFAULT_GLOBALS: &[&str] = &[
    "Duration",
    "Buffer",
    "SlowBuffer",
    "process",
    "setTimeout",
    "setInterval",
    "setImmediate",
    "clearTimeout",
    "clearInterval",
    "clearImmediate",
];

const HOST_PRELUDE: &str = r#"
(() => {
  'use strict';

  const timers = new Map();
  let timerSeq = 0;
  const schedule = (fn, delay, args, repeat) => {
    if (typeof fn !== 'function') throw new TypeError('Callback must be a function');
    const id = ++timerSeq;
    const ms = Math.max(Number(delay) || 0, 0);
    timers.set(id, { fn, args, ms, repeat, at: Date.now() + ms });
    return id;
  };
  const clear = id => { timers.delete(id); };
  const runTimers = () => {
    const now = Date.now();
    for (const [id, timer] of Array.from(timers)) {
      if (!timers.has(id) || timer.at > now) continue;
      if (timer.repeat) timer.at = now + Math.max(timer.ms, 1);
      else timers.delete(id);
      timer.fn(...timer.args);
    }
    return timers.size;
  };

  const utf8 = text => {
    const out = [];
    for (const ch of String(text)) {
      const c = ch.codePointAt(0);
      if (c < 0x80) out.push(c);
      else if (c < 0x800) out.push(0xc0 | (c >> 6), 0x80 | (c & 63));
      else if (c < 0x10000) out.push(0xe0 | (c >> 12), 0x80 | ((c >> 6) & 63), 0x80 | (c & 63));
      else out.push(0xf0 | (c >> 18), 0x80 | ((c >> 12) & 63), 0x80 | ((c >> 6) & 63), 0x80 | (c & 63));
    }
    return out;
  };
  const Buffer = {
    from: value => Uint8Array.from(typeof value === 'string' ? utf8(value) : value),
    alloc: size => new Uint8Array(size),
    byteLength: value => (typeof value === 'string' ? utf8(value).length : value.length),
    isBuffer: value => value instanceof Uint8Array,
  };
  const SlowBuffer = size => new Uint8Array(size);

  const started = Date.now();
  const process = {
    env: {},
    uptime: () => (Date.now() - started) / 1000,
  };

  const routes = [];
  const offloads = [];
  const application = {
    get: (path, handler) => { routes.push(['get', String(path), handler]); },
    post: (path, handler) => { routes.push(['post', String(path), handler]); },
    put: (path, handler) => { routes.push(['put', String(path), handler]); },
    delete: (path, handler) => { routes.push(['delete', String(path), handler]); },
    startWorker: (client, file) => { offloads.push(['start', client, String(file)]); },
    stopWorker: (client, file) => { offloads.push(['stop', client, String(file)]); },
  };

  const invoke = (fn, client) => {
    const state = { done: false, value: undefined, error: undefined };
    const finish = value => {
      if (state.done) return;
      state.done = true;
      state.value = value;
    };
    const result = fn(client, finish);
    if (result && typeof result.then === 'function') {
      result.then(finish, err => {
        if (state.done) return;
        state.done = true;
        state.error = String((err && err.stack) || err);
      });
    } else if (result !== undefined) {
      finish(result);
    }
    return state;
  };

  const runTest = fn => {
    const failures = [];
    const check = (passed, message) => { if (!passed) failures.push(message); };
    const test = {
      ok: (value, message) => check(Boolean(value), message || 'expected a truthy value'),
      equal: (a, b, message) => check(a == b, message || `${a} == ${b}`),
      strictEqual: (a, b, message) => check(a === b, message || `${a} === ${b}`),
      strictSame: (a, b, message) =>
        check(JSON.stringify(a) === JSON.stringify(b), message || 'values differ'),
      fail: message => failures.push(message || 'failed'),
      plan: () => {},
      end: () => {},
      endAfterSubtests: () => {},
    };
    try {
      fn(test);
    } catch (err) {
      failures.push(String((err && err.message) || err));
    }
    return failures;
  };

  return {
    Buffer,
    SlowBuffer,
    process,
    setTimeout: (fn, delay, ...args) => schedule(fn, delay, args, false),
    setInterval: (fn, delay, ...args) => schedule(fn, delay, args, true),
    setImmediate: (fn, ...args) => schedule(fn, 0, args, false),
    clearTimeout: clear,
    clearInterval: clear,
    clearImmediate: clear,
    application,
    __runTimers: runTimers,
    __invoke: invoke,
    __runTest: runTest,
    __drain: () => [routes.splice(0), offloads.splice(0)],
  };
})()
"#;

/// Evaluates the host prelude and completes it with native members.
pub fn create_host(ctx: &mut Context) -> JsResult<JsObject> {
    let host = ctx.eval(Source::from_bytes(HOST_PRELUDE))?;
    let host = host.as_object().map(|o| o.clone()).ok_or_else(|| {
        boa_engine::JsNativeError::typ().with_message("Host prelude did not produce an object")
    })?;

    let duration = NativeFunction::from_fn_ptr(|_, args, ctx| {
        duration_ms(args.first().unwrap_or(&JsValue::undefined()), ctx)
    })
    .to_js_function(ctx.realm());
    host.set(js_string!("Duration"), duration, false, ctx)?;

    let process = host.get(js_string!("process"), ctx)?;
    if let Some(process) = process.as_object() {
        let facts = serde_json::json!({
            "pid": std::process::id(),
            "platform": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
            "version": env!("CARGO_PKG_VERSION"),
        });
        if let Some(map) = facts.as_object() {
            for (key, value) in map {
                let value = json_to_js_value(value, ctx)?;
                process.set(js_string!(key.as_str()), value, false, ctx)?;
            }
        }
    }

    Ok(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_exposes_default_globals() {
        let mut ctx = Context::default();
        let host = create_host(&mut ctx).unwrap();
        for name in DEFAULT_GLOBALS {
            let value = host.get(js_string!(*name), &mut ctx).unwrap();
            assert!(!value.is_undefined(), "{} missing", name);
        }
    }

    #[test]
    fn test_host_is_not_global() {
        let mut ctx = Context::default();
        create_host(&mut ctx).unwrap();
        let value = ctx.eval(Source::from_bytes("typeof setTimeout")).unwrap();
        assert_eq!(value.as_string().unwrap().to_std_string_escaped(), "undefined");
    }
}

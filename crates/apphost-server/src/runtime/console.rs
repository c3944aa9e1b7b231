use boa_engine::{
    js_string, object::JsObject, object::ObjectInitializer, value::JsValue, Context, NativeFunction,
};

use crate::runtime::conversions::display_value;

type Sink = fn(&str, &str);

fn info(app: &str, line: &str) {
    tracing::info!(target: "app", app = %app, "{}", line);
}

fn warn(app: &str, line: &str) {
    tracing::warn!(target: "app", app = %app, "{}", line);
}

fn error(app: &str, line: &str) {
    tracing::error!(target: "app", app = %app, "{}", line);
}

fn debug(app: &str, line: &str) {
    tracing::debug!(target: "app", app = %app, "{}", line);
}

fn method(sink: Sink, app: &str) -> NativeFunction {
    NativeFunction::from_copy_closure_with_captures(
        move |_this: &JsValue, args: &[JsValue], app: &String, ctx: &mut Context| {
            let line = args
                .iter()
                .map(|a| display_value(a, ctx))
                .collect::<Vec<_>>()
                .join(" ");
            sink(app, &line);
            Ok(JsValue::undefined())
        },
        app.to_string(),
    )
}

/// `console` bound to one application: every line carries its name.
pub fn create_console(app: &str, ctx: &mut Context) -> JsObject {
    ObjectInitializer::new(ctx)
        .function(method(info, app), js_string!("log"), 0)
        .function(method(info, app), js_string!("info"), 0)
        .function(method(warn, app), js_string!("warn"), 0)
        .function(method(error, app), js_string!("error"), 0)
        .function(method(debug, app), js_string!("debug"), 0)
        .build()
}

//! Script execution for applications

pub mod console;
pub mod conversions;
pub mod globals;
pub mod modules;
pub mod sandbox;
pub mod script;

pub use sandbox::{Drained, HandlerBody, HandlerOutput, OffloadRequest, PendingCall, RouteRegistration, Sandbox};
pub use script::{current_script_app, ScriptKind, ScriptScope, SCRIPT_PREPARE_TIMEOUT};

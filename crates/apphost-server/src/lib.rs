//! apphost server
//!
//! Everything a worker process needs to host applications:
//!
//! - [`runtime`] - per-application Boa sandboxes, API modules and script compilation
//! - [`cache`] - the memoizing script cache with directory-scoped invalidation
//! - [`watch`] - filesystem notifications feeding cache invalidation
//! - [`application`] - the `Application` type and its staged loader pipeline
//! - [`client`] - request context and body acquisition
//! - [`dispatcher`] - virtual-host routing to applications
//! - [`http_server`] - the hyper listener loop
//!
//! Everything here is single-threaded: applications are shared as
//! `Rc<Application>` and every future runs on a tokio `LocalSet`.

pub mod application;
pub mod cache;
pub mod client;
pub mod collaborators;
pub mod dispatcher;
pub mod error;
pub mod http_server;
pub mod runtime;
pub mod stats;
pub mod watch;

pub use application::{Application, AppOptions, ClientSnapshot, LifecycleEvent};
pub use cache::ScriptCache;
pub use collaborators::Collaborators;
pub use dispatcher::Dispatcher;
pub use error::LoadError;
pub use http_server::{HttpServer, ListenerOptions};
pub use stats::Stats;

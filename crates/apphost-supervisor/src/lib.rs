//! apphost process supervision
//!
//! Every apphost process runs [`run`]. Its role comes from the environment
//! (see [`apphost_common::env`]):
//!
//! - [`master`] forks one worker per listening service and relays control
//!   messages between them
//! - [`worker`] hosts the applications behind one service
//! - [`long_worker`] runs one offloaded script and exits
//!
//! Each process is single-threaded: a current-thread tokio runtime driving a
//! `LocalSet`. Signals, fatal errors, the memory watchdog and the role body
//! itself all end in the context's idempotent shutdown.

pub mod channel;
pub mod context;
pub mod error;
pub mod fatal;
pub mod long_worker;
pub mod master;
pub mod memory;
pub mod process;
pub mod shutdown;
pub mod worker;

use std::path::Path;
use std::rc::Rc;

use apphost_common::{ProcessEnv, ProcessRole};
use futures::future::{FutureExt, LocalBoxFuture};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::LocalSet;

pub use channel::{MessageSink, ParentChannel};
pub use context::ServerContext;
pub use error::{Result, SupervisorError};
pub use fatal::{Fatal, FatalHandler};

use crate::fatal::CRASH_EXIT_CODE;

/// Runs this process in the role its environment selects and returns the
/// exit code. Most paths exit the process from the shutdown sequence
/// instead of returning.
pub fn run(root: &Path) -> Result<i32> {
    let env = ProcessEnv::from_env()?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(SupervisorError::Runtime)?;
    let local = LocalSet::new();
    local.block_on(&runtime, serve(root, env))
}

async fn serve(root: &Path, env: ProcessEnv) -> Result<i32> {
    let parent: Option<Rc<dyn MessageSink>> = match env.role {
        ProcessRole::Worker => Some(Rc::new(ParentChannel)),
        _ => None,
    };
    let ctx = ServerContext::init(root, env, parent)?;
    tracing::info!(node = %ctx.node_id, "{} starting", ctx.process_marker());

    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel();
    let fatal = FatalHandler::new(&ctx.root, shutdown_tx.clone());
    fatal.install_panic_hook();
    forward_signals(shutdown_tx)?;

    if let Some(limit) = ctx.config.scale.memory_limit {
        let interval = ctx.config.scale.memory_check_interval;
        let watched = Rc::clone(&ctx);
        let fatal = fatal.clone();
        tokio::task::spawn_local(async move {
            let message = memory::watchdog(limit, interval, || watched.clear_caches()).await;
            fatal.handle(Fatal::message(message));
        });
    }

    let body: LocalBoxFuture<'_, Result<i32>> = match ctx.env.role {
        ProcessRole::Master => master::run(Rc::clone(&ctx)).boxed_local(),
        ProcessRole::Worker => worker::run(Rc::clone(&ctx)).boxed_local(),
        ProcessRole::LongWorker => {
            let ctx = Rc::clone(&ctx);
            async move {
                let job = ctx.env.job.clone().ok_or_else(|| {
                    apphost_common::HostError::Environment("long worker without a job".into())
                })?;
                long_worker::run_job(&ctx, &job).await
            }
            .boxed_local()
        }
    };

    let code = tokio::select! {
        result = body => match result {
            Ok(code) => code,
            Err(e) => {
                fatal.handle(Fatal::from_error(&e));
                CRASH_EXIT_CODE
            }
        },
        Some(code) = shutdown_rx.recv() => code,
    };

    ctx.shutdown(code);
    Ok(code)
}

/// SIGINT and SIGTERM request a clean shutdown.
fn forward_signals(shutdown: UnboundedSender<i32>) -> Result<()> {
    let mut interrupt = signal(SignalKind::interrupt()).map_err(SupervisorError::Runtime)?;
    let mut terminate = signal(SignalKind::terminate()).map_err(SupervisorError::Runtime)?;
    tokio::task::spawn_local(async move {
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
        let _ = shutdown.send(0);
    });
    Ok(())
}

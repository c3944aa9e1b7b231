//! Master runner
//!
//! On first start the master forks one worker per non-master service, wires
//! each worker's standard streams into an IPC channel and relays long-worker
//! announcements between workers. A service named `master` is hosted by the
//! master process itself.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use apphost_common::env::{APPHOST_MODE, WORKER_ID, WORKER_SERVER_NAME, WORKER_SERVER_PROTO};
use apphost_common::{env::node_id, IpcMessage, Service};
use tokio::io::BufReader;
use tokio::process::Child;

use crate::channel::{read_messages, ChildChannel};
use crate::context::ServerContext;
use crate::error::{Result, SupervisorError};
use crate::process::{spawn_child, ChildSpec};
use crate::worker::host_service;

/// A worker to fork.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPlan {
    pub id: u32,
    pub service: String,
    pub protocol: String,
}

/// Channels to running workers by worker id.
pub type Workers = Rc<RefCell<BTreeMap<u32, ChildChannel>>>;

/// One worker per non-master service, numbered from 1 in service order.
/// Nothing is forked again after the first start.
pub fn plan_workers(services: &[Service], first_start: bool) -> Vec<WorkerPlan> {
    if !first_start {
        return Vec::new();
    }
    services
        .iter()
        .filter(|service| !service.is_master())
        .zip(1..)
        .map(|(service, id)| WorkerPlan {
            id,
            service: service.name.clone(),
            protocol: service.config.protocol.clone(),
        })
        .collect()
}

/// Sends `message` to every worker except `except`. Returns the number of
/// workers reached.
pub fn retranslate(workers: &BTreeMap<u32, ChildChannel>, except: u32, message: &IpcMessage) -> usize {
    workers
        .iter()
        .filter(|(id, _)| **id != except)
        .filter(|(_, channel)| channel.send(message.clone()))
        .count()
}

fn fork_worker(ctx: &Rc<ServerContext>, plan: &WorkerPlan, workers: &Workers) -> Result<()> {
    let spec = ChildSpec {
        what: format!("worker {}", plan.service),
        root: ctx.root.clone(),
        env: vec![
            (WORKER_SERVER_NAME, plan.service.clone()),
            (WORKER_SERVER_PROTO, plan.protocol.clone()),
            (WORKER_ID, plan.id.to_string()),
            (APPHOST_MODE, ctx.env.mode.clone()),
        ],
        ipc: true,
    };
    let mut child = spawn_child(&spec)?;
    let worker_node = node_id(&ctx.config.scale.server, plan.id);
    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
        return Err(SupervisorError::Spawn {
            what: spec.what,
            source: std::io::Error::other("worker has no IPC pipes"),
        });
    };

    if let Some(pid) = child.id() {
        ctx.add_child(&worker_node, pid);
    }
    ctx.stats.forked();
    workers.borrow_mut().insert(plan.id, ChildChannel::spawn(stdin));

    tokio::task::spawn_local(relay(
        Rc::clone(ctx),
        plan.id,
        worker_node.clone(),
        read_messages(BufReader::new(stdout)),
        Rc::clone(workers),
    ));
    tokio::task::spawn_local(reap(Rc::clone(ctx), plan.id, worker_node, child, Rc::clone(workers)));
    Ok(())
}

/// Handles everything one worker sends.
async fn relay(
    ctx: Rc<ServerContext>,
    id: u32,
    worker_node: String,
    mut incoming: tokio::sync::mpsc::UnboundedReceiver<IpcMessage>,
    workers: Workers,
) {
    while let Some(message) = incoming.recv().await {
        ctx.stats.event();
        match &message {
            IpcMessage::Start { id } => tracing::info!(node = %worker_node, "Worker {} started", id),
            IpcMessage::Exit { error: Some(error), .. } => tracing::error!(node = %worker_node, "{}", error),
            IpcMessage::Exit { code, .. } => tracing::info!(node = %worker_node, code = ?code, "Worker exiting"),
            IpcMessage::ForkLongWorker { node_id, pid, .. } => {
                ctx.add_child(node_id, *pid);
                retranslate(&workers.borrow(), id, &message);
            }
            IpcMessage::ExitLongWorker { node_id, .. } => {
                ctx.remove_child(node_id);
                retranslate(&workers.borrow(), id, &message);
            }
        }
    }
}

async fn reap(ctx: Rc<ServerContext>, id: u32, worker_node: String, mut child: Child, workers: Workers) {
    let status = child.wait().await;
    workers.borrow_mut().remove(&id);
    ctx.remove_child(&worker_node);
    if ctx.is_shutting_down() {
        return;
    }
    match status {
        Ok(status) => tracing::warn!(node = %worker_node, code = ?status.code(), "Worker terminated"),
        Err(e) => tracing::warn!(node = %worker_node, "Lost worker: {}", e),
    }
}

/// Body of the master process. Runs until shutdown.
pub async fn run(ctx: Rc<ServerContext>) -> Result<i32> {
    let workers: Workers = Rc::new(RefCell::new(BTreeMap::new()));
    for plan in plan_workers(&ctx.services, true) {
        fork_worker(&ctx, &plan, &workers)?;
    }

    if let Some(service) = ctx.services.iter().find(|s| s.is_master()).cloned() {
        host_service(&ctx, &service).await?;
    }
    tracing::info!(node = %ctx.node_id, workers = workers.borrow().len(), "Master started");

    std::future::pending::<()>().await;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use apphost_common::config::ServerSections;
    use tokio::io::AsyncBufReadExt;
    use tokio::task::LocalSet;

    fn services() -> Vec<Service> {
        let config: ServerSections = toml::from_str(
            r#"
            [servers.master]
            protocol = "jstp"
            ports = [250]
            [servers.www]
            protocol = "http"
            ports = [8001, 8002]
            [servers.api]
            protocol = "jstp"
            ports = [3000]
            "#,
        )
        .unwrap();
        config.services(4).unwrap()
    }

    #[test]
    fn test_plan_excludes_master_and_numbers_from_one() {
        let plan = plan_workers(&services(), true);
        let names: Vec<(u32, &str)> = plan.iter().map(|p| (p.id, p.service.as_str())).collect();
        assert_eq!(names, vec![(1, "api3000"), (2, "www8001"), (3, "www8002")]);
        assert_eq!(plan[1].protocol, "http");
    }

    #[test]
    fn test_no_forks_after_first_start() {
        assert!(plan_workers(&services(), false).is_empty());
    }

    #[tokio::test]
    async fn test_retranslate_skips_sender() {
        LocalSet::new()
            .run_until(async {
                let mut readers = Vec::new();
                let mut workers = BTreeMap::new();
                for id in 1..=3 {
                    let (write, read) = tokio::io::duplex(1024);
                    workers.insert(id, ChildChannel::spawn(write));
                    readers.push(BufReader::new(read).lines());
                }
                let message = IpcMessage::ExitLongWorker {
                    app_name: "shop".into(),
                    node_id: "S1N2L9".into(),
                };
                assert_eq!(retranslate(&workers, 2, &message), 2);
                drop(workers);

                let mut received = Vec::new();
                for lines in readers.iter_mut() {
                    received.push(lines.next_line().await.unwrap().is_some());
                }
                assert_eq!(received, vec![true, false, true]);
            })
            .await;
    }
}

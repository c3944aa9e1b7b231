// Hosted service tests
//
// A worker context is built over a temporary server root; its service is
// hosted in-process on a LocalSet.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::rc::Rc;

use apphost_common::config::ServerSections;
use apphost_common::{HostError, IpcMessage, ProcessEnv};
use apphost_supervisor::channel::{MessageSink, RecordingSink};
use apphost_supervisor::worker::host_service;
use apphost_supervisor::{ServerContext, SupervisorError};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request, StatusCode};
use tempfile::TempDir;
use tokio::task::LocalSet;

// ============================================================================
// Test Helpers
// ============================================================================

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn worker_context(root: &Path, port: u16, sink: Rc<RecordingSink>) -> Rc<ServerContext> {
    let config: ServerSections = toml::from_str(&format!(
        "[servers.www]\nprotocol = \"http\"\naddress = \"127.0.0.1\"\nports = [{}]",
        port
    ))
    .unwrap();
    let vars: HashMap<String, String> = [
        ("WORKER_SERVER_NAME", format!("www{}", port)),
        ("WORKER_SERVER_PROTO", "http".to_string()),
        ("WORKER_ID", "1".to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();
    let env = ProcessEnv::from_vars(vars).unwrap();
    let parent: Rc<dyn MessageSink> = sink;
    Rc::new(ServerContext::new(root, env, config, Some(parent)).unwrap())
}

fn server_root(root: &Path) {
    write(root, "applications/shop/config/hosts.toml", "hosts = [\"shop.local\"]");
    write(root, "applications/shop/www/get.js", "() => 'shop home'");
    write(root, "applications/blog/config/hosts.toml", "hosts = [\"*\"]");
    write(root, "applications/blog/www/get.js", "() => 'blog home'");
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_hosted_service_serves_every_application() {
    LocalSet::new()
        .run_until(async {
            let root = TempDir::new().unwrap();
            server_root(root.path());
            let sink = Rc::new(RecordingSink::default());
            let ctx = worker_context(root.path(), 0, sink.clone());
            let service = ctx.own_service().cloned().unwrap();

            let hosted = host_service(&ctx, &service).await.unwrap();
            let names: Vec<&str> = hosted.applications.iter().map(|a| a.name()).collect();
            assert_eq!(names, vec!["blog", "shop"]);
            assert!(hosted.applications.iter().all(|a| a.is_ready()));
            assert_eq!(ctx.applications().len(), 2);

            let request = Request::get("/")
                .header("host", "anything.org")
                .body(Full::new(Bytes::new()))
                .unwrap();
            let response = hosted.dispatcher.dispatch(request, None).await;
            assert_eq!(response.status(), StatusCode::OK);
            let body = response.into_body().collect().await.unwrap().to_bytes();
            assert_eq!(&body[..], b"blog home");
            assert!(sink.sent().is_empty());
        })
        .await;
}

#[tokio::test]
async fn test_bind_failure_is_reported_to_master() {
    LocalSet::new()
        .run_until(async {
            let root = TempDir::new().unwrap();
            server_root(root.path());
            let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let port = taken.local_addr().unwrap().port();
            let sink = Rc::new(RecordingSink::default());
            let ctx = worker_context(root.path(), port, sink.clone());
            let service = ctx.own_service().cloned().unwrap();

            let result = host_service(&ctx, &service).await;
            assert!(matches!(
                result,
                Err(SupervisorError::Host(HostError::Bind { .. }))
            ));
            let expected = format!("Can't bind to 127.0.0.1:{}", port);
            assert_eq!(
                sink.sent(),
                vec![IpcMessage::Exit {
                    code: None,
                    error: Some(expected),
                }]
            );
        })
        .await;
}

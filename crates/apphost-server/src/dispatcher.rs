//! Virtual-host dispatch
//!
//! Requests go to the first application, in registration order, whose host
//! patterns match the request's `Host` (port stripped). A pattern is either
//! an exact host, `*`, or a host with one `*` segment (`*.example.com`,
//! `api.*.local`). An application with no patterns never matches.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::header::{HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};

use crate::application::Application;
use crate::client::{parse_host, Client};
use crate::runtime::HandlerBody;
use crate::stats::Stats;

pub type ResponseBody = Full<Bytes>;

/// Whether `host` matches any of `patterns`.
pub fn host_matches(patterns: &[String], host: &str) -> bool {
    patterns.iter().any(|pattern| pattern_matches(pattern, host))
}

fn pattern_matches(pattern: &str, host: &str) -> bool {
    if pattern == "*" || pattern == host {
        return true;
    }
    match pattern.split_once('*') {
        Some((prefix, suffix)) => {
            host.len() >= prefix.len() + suffix.len()
                && host.starts_with(prefix)
                && host.ends_with(suffix)
        }
        None => false,
    }
}

/// Pairs of host patterns that can match the same host, across all given
/// applications: identical patterns, or `*` against anything.
pub fn overlapping_hosts<'a>(
    hosts: impl IntoIterator<Item = &'a [String]>,
) -> Vec<(String, String)> {
    let mut seen: Vec<&str> = Vec::new();
    let mut overlaps = Vec::new();
    for patterns in hosts {
        for pattern in patterns {
            let mut found = false;
            for other in &seen {
                found |= pattern == other;
                if pattern == other || pattern == "*" || *other == "*" {
                    overlaps.push((pattern.clone(), other.to_string()));
                }
            }
            if !found {
                seen.push(pattern);
            }
        }
    }
    overlaps
}

/// Plain response with `status` and a short HTML body.
pub fn error_response(status: StatusCode) -> Response<ResponseBody> {
    let text = format!(
        "<h1>{} {}</h1>",
        status.as_u16(),
        status.canonical_reason().unwrap_or_default()
    );
    let mut response = Response::new(Full::new(Bytes::from(text)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
    response
}

pub struct Dispatcher {
    applications: RefCell<Vec<Rc<Application>>>,
    stats: Rc<Stats>,
}

impl Dispatcher {
    pub fn new(stats: Rc<Stats>) -> Self {
        Self {
            applications: RefCell::new(Vec::new()),
            stats,
        }
    }

    pub fn add(&self, application: Rc<Application>) {
        self.applications.borrow_mut().push(application);
    }

    pub fn applications(&self) -> Vec<Rc<Application>> {
        self.applications.borrow().clone()
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// First application whose patterns match `host`.
    pub fn find(&self, host: &str) -> Option<Rc<Application>> {
        self.applications
            .borrow()
            .iter()
            .find(|app| host_matches(app.hosts(), host))
            .cloned()
    }

    /// Routes one request to the first application whose host patterns
    /// match and renders its response.
    ///
    /// # Arguments
    ///
    /// * `req` - The incoming request; non-GET bodies are buffered and parsed
    /// * `remote` - Peer address for the access log, if known
    ///
    /// # Returns
    ///
    /// The response: static file, handler output, or 400, 404, 500 or 503
    ///
    /// # Example
    ///
    /// ```no_run
    /// use std::rc::Rc;
    ///
    /// use apphost_server::{Dispatcher, Stats};
    /// use bytes::Bytes;
    /// use http_body_util::Full;
    /// use hyper::Request;
    ///
    /// # async fn example() {
    /// let dispatcher = Dispatcher::new(Rc::new(Stats::default()));
    /// let request = Request::get("/cart")
    ///     .header("host", "shop.local")
    ///     .body(Full::new(Bytes::new()))
    ///     .unwrap();
    /// let response = dispatcher.dispatch(request, None).await;
    /// assert_eq!(response.status(), 404);
    /// # }
    /// ```
    pub async fn dispatch<B>(&self, req: Request<B>, remote: Option<SocketAddr>) -> Response<ResponseBody>
    where
        B: Body<Data = Bytes>,
        B::Error: std::fmt::Display,
    {
        self.stats.request();
        let host = parse_host(req.headers());
        let response = match self.find(&host) {
            None => {
                let client = Client::new(&req.into_parts().0, remote);
                let response = error_response(StatusCode::NOT_FOUND);
                tracing::info!(target: "access", app = "-", "{}", client.access_line(404));
                response
            }
            Some(application) if !application.is_ready() => error_response(StatusCode::SERVICE_UNAVAILABLE),
            Some(application) => self.dispatch_to(&application, req, remote).await,
        };
        self.stats.response();
        response
    }

    async fn dispatch_to<B>(
        &self,
        application: &Application,
        req: Request<B>,
        remote: Option<SocketAddr>,
    ) -> Response<ResponseBody>
    where
        B: Body<Data = Bytes>,
        B::Error: std::fmt::Display,
    {
        let (parts, body) = req.into_parts();
        let mut client = Client::new(&parts, remote);
        client.slow_time = application.slow_time();

        let response = if parts.method == Method::GET {
            match application.static_file(&client.path).await {
                Some(entry) => {
                    let mime = mime_guess::from_path(&client.path).first_or_octet_stream();
                    let mut response = Response::new(Full::new(entry.data.clone()));
                    if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
                        response.headers_mut().insert(CONTENT_TYPE, value);
                    }
                    if entry.compressed {
                        response
                            .headers_mut()
                            .insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
                    }
                    response
                }
                None => self.run_handler(application, &client).await,
            }
        } else {
            // the body is always read to the end, even when it is malformed
            match body.collect().await {
                Ok(collected) => match client.acquire_body(collected.to_bytes()).await {
                    Ok(()) => self.run_handler(application, &client).await,
                    Err(e) => {
                        tracing::debug!(app = %application.name(), "{}", e);
                        error_response(StatusCode::BAD_REQUEST)
                    }
                },
                Err(e) => {
                    tracing::debug!(app = %application.name(), "Can't read request body: {}", e);
                    error_response(StatusCode::BAD_REQUEST)
                }
            }
        };

        let line = client.access_line(response.status().as_u16());
        tracing::info!(target: "access", app = %application.name(), "{}", line);
        if client.elapsed() >= client.slow_time {
            tracing::warn!(target: "slow", app = %application.name(), "{}", line);
        }
        response
    }

    async fn run_handler(&self, application: &Application, client: &Client) -> Response<ResponseBody> {
        let Some((key, handler)) = application.route(&client.method, &client.path).await else {
            return error_response(StatusCode::NOT_FOUND);
        };
        match application.invoke(&key, &handler, &client.to_json()).await {
            Ok(output) => {
                let status = StatusCode::from_u16(output.status).unwrap_or(StatusCode::OK);
                let (body, default_type) = match output.body {
                    HandlerBody::Empty => (Bytes::new(), "text/html; charset=utf-8"),
                    HandlerBody::Text(text) => (Bytes::from(text), "text/html; charset=utf-8"),
                    HandlerBody::Json(value) => (
                        Bytes::from(value.to_string()),
                        "application/json; charset=utf-8",
                    ),
                };
                let content_type = output
                    .content_type
                    .and_then(|ct| HeaderValue::from_str(&ct).ok())
                    .unwrap_or_else(|| HeaderValue::from_static(default_type));
                let mut response = Response::new(Full::new(body));
                *response.status_mut() = status;
                response.headers_mut().insert(CONTENT_TYPE, content_type);
                response
            }
            Err(e) => {
                application.log_exception(&e);
                error_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

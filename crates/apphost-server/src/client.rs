//! Request context handed to handlers
//!
//! A `Client` is built from the request head. For non-GET requests the body
//! is read to the end before routing and parsed according to its declared
//! content type: multipart forms, JSON, or URL-encoded fields.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use hyper::header::{HeaderMap, CONTENT_TYPE, HOST, REFERER, USER_AGENT};
use hyper::http::request::Parts;
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;

use crate::application::route_dir_key;
use crate::runtime::modules::parse_query;

#[derive(Error, Debug)]
pub enum BodyError {
    #[error("Malformed multipart body: {0}")]
    Multipart(#[from] multer::Error),

    #[error("Malformed JSON body: {0}")]
    Json(#[from] serde_json::Error),
}

/// Parsed request body.
#[derive(Debug, Clone, PartialEq)]
pub struct Body {
    pub fields: JsonValue,
    /// Uploaded files by field name: `{ name, type, size }`
    pub files: JsonValue,
    /// Raw body text, empty for multipart
    pub data: String,
}

impl Default for Body {
    fn default() -> Self {
        Self {
            fields: JsonValue::Object(Map::new()),
            files: JsonValue::Object(Map::new()),
            data: String::new(),
        }
    }
}

/// Parses a fully read body according to `content_type`.
pub async fn parse_body(content_type: Option<&str>, body: Bytes) -> Result<Body, BodyError> {
    match content_type {
        Some(ct) if ct.starts_with("multipart") => parse_multipart(ct, body).await,
        Some(ct) if ct.starts_with("application/json") => {
            let data = String::from_utf8_lossy(&body).into_owned();
            let fields = if data.trim().is_empty() {
                JsonValue::Object(Map::new())
            } else {
                serde_json::from_str(&data)?
            };
            Ok(Body {
                fields,
                data,
                ..Body::default()
            })
        }
        _ => {
            let data = String::from_utf8_lossy(&body).into_owned();
            Ok(Body {
                fields: parse_query(&data),
                data,
                ..Body::default()
            })
        }
    }
}

async fn parse_multipart(content_type: &str, body: Bytes) -> Result<Body, BodyError> {
    let boundary = multer::parse_boundary(content_type)?;
    let stream = futures::stream::once(async move { Ok::<Bytes, Infallible>(body) });
    let mut multipart = multer::Multipart::new(stream, boundary);

    let mut fields = Map::new();
    let mut files = Map::new();
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match field.file_name().map(str::to_string) {
            Some(file_name) => {
                let content_type = field.content_type().map(|m| m.to_string());
                let data = field.bytes().await?;
                files.insert(
                    name,
                    json!({ "name": file_name, "type": content_type, "size": data.len() }),
                );
            }
            None => {
                fields.insert(name, JsonValue::String(field.text().await?));
            }
        }
    }
    Ok(Body {
        fields: JsonValue::Object(fields),
        files: JsonValue::Object(files),
        data: String::new(),
    })
}

/// `Host` header without a port.
pub fn parse_host(headers: &HeaderMap) -> String {
    let host = headers
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();
    if host.starts_with('[') {
        // [::1]:8080
        return host
            .split_once(']')
            .map_or(host, |(addr, _)| addr.trim_start_matches('['))
            .to_string();
    }
    host.split(':').next().unwrap_or_default().to_string()
}

pub struct Client {
    /// Lowercase HTTP method
    pub method: String,
    pub url: String,
    pub path: String,
    pub query: JsonValue,
    pub host: String,
    pub remote: Option<SocketAddr>,
    pub content_type: Option<String>,
    pub agent: Option<String>,
    pub referer: Option<String>,
    pub body: Body,
    /// Session fields visible to scripts, when a session layer provides them
    pub session: Option<JsonValue>,
    pub started: Instant,
    pub slow_time: Duration,
}

impl Client {
    pub fn new(parts: &Parts, remote: Option<SocketAddr>) -> Self {
        let header = |name| {
            parts
                .headers
                .get(name)
                .and_then(|h| h.to_str().ok())
                .map(str::to_string)
        };
        Self {
            method: parts.method.as_str().to_ascii_lowercase(),
            url: parts
                .uri
                .path_and_query()
                .map_or_else(|| parts.uri.path().to_string(), |pq| pq.as_str().to_string()),
            path: parts.uri.path().to_string(),
            query: parts.uri.query().map_or_else(|| json!({}), parse_query),
            host: parse_host(&parts.headers),
            remote,
            content_type: header(CONTENT_TYPE),
            agent: header(USER_AGENT),
            referer: header(REFERER),
            body: Body::default(),
            session: None,
            started: Instant::now(),
            slow_time: Duration::MAX,
        }
    }

    /// Application-relative directory of the handlers for this path.
    pub fn path_dir(&self) -> String {
        route_dir_key(&self.path).unwrap_or_else(|| "/www/".to_string())
    }

    pub fn ip(&self) -> String {
        self.remote.map_or_else(|| "-".to_string(), |r| r.ip().to_string())
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Reads the parsed body into the client.
    pub async fn acquire_body(&mut self, body: Bytes) -> Result<(), BodyError> {
        self.body = parse_body(self.content_type.as_deref(), body).await?;
        Ok(())
    }

    /// The object scripts see as `client`.
    pub fn to_json(&self) -> JsonValue {
        json!({
            "method": self.method,
            "url": self.url,
            "path": self.path,
            "pathDir": self.path_dir(),
            "host": self.host,
            "ip": self.ip(),
            "query": self.query,
            "context": { "path": self.path, "host": self.host },
            "fields": self.body.fields,
            "files": self.body.files,
            "data": self.body.data,
            "session": self.session,
            "status": 200,
        })
    }

    /// One access-log line:
    /// `elapsed ip login token method status url agent referer`.
    pub fn access_line(&self, status: u16) -> String {
        let session_field = |name: &str| {
            self.session
                .as_ref()
                .and_then(|s| s.get(name))
                .and_then(|v| v.as_str())
                .unwrap_or("-")
                .to_string()
        };
        format!(
            "{}ms {} {} {} {} {} {} {} {}",
            self.elapsed().as_millis(),
            self.ip(),
            session_field("login"),
            session_field("token"),
            self.method.to_ascii_uppercase(),
            status,
            self.url,
            self.agent.as_deref().unwrap_or("-"),
            self.referer.as_deref().unwrap_or("-"),
        )
    }
}

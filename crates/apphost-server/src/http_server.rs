//! HTTP listener
//!
//! One hyper HTTP/1.1 connection task per accepted socket, all on the local
//! set of the worker. A connection that sends no request head within the
//! keep-alive interval is closed; a request that does not complete within
//! the service timeout is answered with 408.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use apphost_common::config::{Service, DEFAULT_KEEP_ALIVE, DEFAULT_TIMEOUT};
use apphost_common::HostError;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::StatusCode;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::TcpListener;

use crate::dispatcher::{error_response, Dispatcher};

/// Socket settings applied to every accepted connection.
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    /// `host:port`; a `*` host listens on every interface
    pub address: String,
    pub keep_alive: Duration,
    pub timeout: Duration,
    /// Leave Nagle's algorithm on
    pub nagle: bool,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:0".to_string(),
            keep_alive: DEFAULT_KEEP_ALIVE,
            timeout: DEFAULT_TIMEOUT,
            nagle: false,
        }
    }
}

impl From<&Service> for ListenerOptions {
    fn from(service: &Service) -> Self {
        Self {
            address: service.address(),
            keep_alive: service.keep_alive(),
            timeout: service.timeout(),
            nagle: service.config.nagle,
        }
    }
}

impl ListenerOptions {
    fn bind_address(&self) -> String {
        match self.address.strip_prefix("*:") {
            Some(port) => format!("0.0.0.0:{}", port),
            None => self.address.clone(),
        }
    }
}

pub struct HttpServer {
    dispatcher: Rc<Dispatcher>,
    options: ListenerOptions,
    listener: TcpListener,
}

impl HttpServer {
    /// Binds the listening socket. Address-in-use and permission errors
    /// become [`HostError::Bind`].
    pub async fn bind(dispatcher: Rc<Dispatcher>, options: ListenerOptions) -> Result<Self, HostError> {
        let listener = TcpListener::bind(options.bind_address())
            .await
            .map_err(|e| {
                tracing::debug!("Bind {} failed: {}", options.address, e);
                HostError::Bind {
                    address: options.address.clone(),
                }
            })?;
        Ok(Self {
            dispatcher,
            options,
            listener,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until the task is dropped. Must run inside a
    /// `LocalSet`.
    pub async fn run(self) {
        let Self {
            dispatcher,
            options,
            listener,
        } = self;
        loop {
            let (stream, remote) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };
            if !options.nagle {
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!("Can't disable Nagle for {}: {}", remote, e);
                }
            }

            let io = TokioIo::new(stream);
            let dispatcher = Rc::clone(&dispatcher);
            let timeout = options.timeout;
            let keep_alive = options.keep_alive;

            tokio::task::spawn_local(async move {
                let service = service_fn(move |req| {
                    let dispatcher = Rc::clone(&dispatcher);
                    async move {
                        let response =
                            match tokio::time::timeout(timeout, dispatcher.dispatch(req, Some(remote))).await {
                                Ok(response) => response,
                                Err(_) => error_response(StatusCode::REQUEST_TIMEOUT),
                            };
                        Ok::<_, Infallible>(response)
                    }
                });

                if let Err(err) = http1::Builder::new()
                    .timer(TokioTimer::new())
                    .header_read_timeout(keep_alive)
                    .serve_connection(io, service)
                    .await
                {
                    tracing::debug!("Error serving connection from {}: {}", remote, err);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Stats;

    #[test]
    fn test_wildcard_address() {
        let options = ListenerOptions {
            address: "*:8080".to_string(),
            ..ListenerOptions::default()
        };
        assert_eq!(options.bind_address(), "0.0.0.0:8080");
    }

    #[tokio::test]
    async fn test_address_in_use_is_bind_error() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = taken.local_addr().unwrap().to_string();
        let dispatcher = Rc::new(Dispatcher::new(Rc::new(Stats::default())));
        let result = HttpServer::bind(
            dispatcher,
            ListenerOptions {
                address: address.clone(),
                ..ListenerOptions::default()
            },
        )
        .await;
        match result {
            Err(HostError::Bind { address: failed }) => assert_eq!(failed, address),
            _ => panic!("expected a bind error"),
        }
    }
}

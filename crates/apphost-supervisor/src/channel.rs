//! IPC transport
//!
//! Master and child talk over the child's standard streams, one JSON message
//! per line: the child writes to its stdout and reads its stdin. Logging
//! therefore never goes to a child's stdout.

use std::cell::RefCell;
use std::io::Write;

use apphost_common::IpcMessage;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Outgoing side of a channel.
pub trait MessageSink {
    fn send(&self, message: &IpcMessage);
}

/// The child's channel to its master. Writes are synchronous so that exit
/// notifications go out even while the process is shutting down.
#[derive(Debug, Default)]
pub struct ParentChannel;

impl MessageSink for ParentChannel {
    fn send(&self, message: &IpcMessage) {
        let encoded = match message.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!("Can't encode {}: {}", message.name(), e);
                return;
            }
        };
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = stdout.write_all(&encoded).and_then(|_| stdout.flush()) {
            tracing::debug!("Can't send {} to master: {}", message.name(), e);
        }
    }
}

/// Keeps sent messages in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    sent: RefCell<Vec<IpcMessage>>,
}

impl RecordingSink {
    pub fn sent(&self) -> Vec<IpcMessage> {
        self.sent.borrow().clone()
    }
}

impl MessageSink for RecordingSink {
    fn send(&self, message: &IpcMessage) {
        self.sent.borrow_mut().push(message.clone());
    }
}

/// Master-side handle writing to one child's stdin.
#[derive(Debug, Clone)]
pub struct ChildChannel {
    tx: UnboundedSender<IpcMessage>,
}

impl ChildChannel {
    /// Starts the writer task. Must run inside a `LocalSet`.
    pub fn spawn<W>(mut writer: W) -> Self
    where
        W: AsyncWrite + Unpin + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<IpcMessage>();
        tokio::task::spawn_local(async move {
            while let Some(message) = rx.recv().await {
                let encoded = match message.encode() {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        tracing::error!("Can't encode {}: {}", message.name(), e);
                        continue;
                    }
                };
                if writer.write_all(&encoded).await.is_err() || writer.flush().await.is_err() {
                    break;
                }
            }
        });
        Self { tx }
    }

    pub fn send(&self, message: IpcMessage) -> bool {
        self.tx.send(message).is_ok()
    }
}

/// Decodes messages from `reader` until it closes. Undecodable lines are
/// logged and skipped.
pub fn read_messages<R>(reader: R) -> UnboundedReceiver<IpcMessage>
where
    R: AsyncBufRead + Unpin + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::task::spawn_local(async move {
        let mut lines = reader.lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match IpcMessage::decode(&line) {
                    Ok(message) => {
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("Ignoring IPC line: {}", e),
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!("IPC channel closed: {}", e);
                    break;
                }
            }
        }
    });
    rx
}

//! Out-of-band control: a UNIX socket that exists only while an IRC
//! client is attached. One length-prefixed JSON request per connection,
//! one length-prefixed JSON response. Requests are forwarded into the
//! bridge loop rather than acting on shared state directly.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const MAX_REQUEST_BYTES: u32 = 1024 * 1024;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum ControlRequest {
    SendMessage { target: String, text: String },
    SendFile { target: String, path: String },
    GetConfig,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ControlResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
}

impl ControlResponse {
    pub fn success() -> Self {
        Self {
            ok: true,
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_config(config: Value) -> Self {
        Self {
            ok: true,
            config: Some(config),
            ..Default::default()
        }
    }
}

pub type ControlMessage = (ControlRequest, oneshot::Sender<ControlResponse>);

pub struct ControlHandle {
    task: JoinHandle<()>,
    path: PathBuf,
}

impl Drop for ControlHandle {
    fn drop(&mut self) {
        self.task.abort();
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Bind the socket and start serving. The returned handle unbinds and
/// unlinks on drop, so the socket disappears with the IRC client.
pub fn spawn(path: &Path, tx: mpsc::Sender<ControlMessage>) -> Result<ControlHandle> {
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path)
        .with_context(|| format!("cannot bind control socket at {}", path.display()))?;
    let task = tokio::spawn(serve(listener, tx));
    Ok(ControlHandle {
        task,
        path: path.to_path_buf(),
    })
}

async fn serve(listener: UnixListener, tx: mpsc::Sender<ControlMessage>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, tx).await {
                        debug!("control connection failed: {err}");
                    }
                });
            }
            Err(err) => {
                warn!("control socket accept failed: {err}");
                return;
            }
        }
    }
}

async fn handle_connection(
    mut stream: UnixStream,
    tx: mpsc::Sender<ControlMessage>,
) -> Result<()> {
    let length = stream.read_u32().await?;
    if length > MAX_REQUEST_BYTES {
        bail!("control request of {length} bytes exceeds the limit");
    }
    let mut body = vec![0u8; length as usize];
    stream.read_exact(&mut body).await?;

    let response = match serde_json::from_slice::<ControlRequest>(&body) {
        Ok(request) => {
            let (reply_tx, reply_rx) = oneshot::channel();
            if tx.send((request, reply_tx)).await.is_err() {
                ControlResponse::failure("bridge is shutting down")
            } else {
                reply_rx
                    .await
                    .unwrap_or_else(|_| ControlResponse::failure("bridge dropped the request"))
            }
        }
        Err(err) => ControlResponse::failure(format!("bad request: {err}")),
    };

    let body = serde_json::to_vec(&response)?;
    stream.write_u32(body.len() as u32).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip(request: &[u8]) -> (Option<ControlRequest>, Value) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let (tx, mut rx) = mpsc::channel(4);
        let _handle = spawn(&path, tx).unwrap();

        let answerer = tokio::spawn(async move {
            match rx.recv().await {
                Some((request, reply)) => {
                    let _ = reply.send(ControlResponse::success());
                    Some(request)
                }
                None => None,
            }
        });

        let mut stream = UnixStream::connect(&path).await.unwrap();
        stream.write_u32(request.len() as u32).await.unwrap();
        stream.write_all(request).await.unwrap();

        let length = stream.read_u32().await.unwrap();
        let mut body = vec![0u8; length as usize];
        stream.read_exact(&mut body).await.unwrap();
        let response: Value = serde_json::from_slice(&body).unwrap();

        drop(stream);
        let seen = tokio::time::timeout(std::time::Duration::from_secs(1), answerer)
            .await
            .ok()
            .and_then(|r| r.ok())
            .flatten();
        (seen, response)
    }

    #[tokio::test]
    async fn send_message_request_reaches_the_bridge() {
        let (seen, response) =
            roundtrip(br##"{"op":"send-message","target":"#general","text":"hi"}"##).await;
        assert_eq!(
            seen,
            Some(ControlRequest::SendMessage {
                target: "#general".to_string(),
                text: "hi".to_string(),
            })
        );
        assert_eq!(response["ok"], true);
    }

    #[tokio::test]
    async fn malformed_request_gets_an_error_response() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let (tx, _rx) = mpsc::channel(4);
        let _handle = spawn(&path, tx).unwrap();

        let mut stream = UnixStream::connect(&path).await.unwrap();
        stream.write_u32(8).await.unwrap();
        stream.write_all(b"not json").await.unwrap();

        let length = stream.read_u32().await.unwrap();
        let mut body = vec![0u8; length as usize];
        stream.read_exact(&mut body).await.unwrap();
        let response: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(response["ok"], false);
    }

    #[tokio::test]
    async fn socket_vanishes_when_handle_drops() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let (tx, _rx) = mpsc::channel(4);
        let handle = spawn(&path, tx).unwrap();
        assert!(path.exists());
        drop(handle);
        assert!(!path.exists());
    }
}

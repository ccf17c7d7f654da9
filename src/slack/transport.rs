//! HTTPS and WebSocket plumbing for the Slack Web and RTM APIs:
//! form-encoded calls with token+cookie auth, multipart uploads, and a
//! self-healing event socket with backoff, ping and watchdog.

use std::time::Duration;

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tracing::{debug, info, warn};

const API_BASE: &str = "https://slack.com/api";

const CALL_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);
const RTM_PING_INTERVAL: Duration = Duration::from_secs(15);
const RTM_WATCHDOG: Duration = Duration::from_secs(40);

/// Error codes for which retrying with the same credentials is useless.
const AUTH_ERRORS: [&str; 5] = [
    "invalid_auth",
    "not_authed",
    "account_inactive",
    "token_revoked",
    "two_factor_setup_required",
];

#[derive(Error, Debug)]
pub enum SlackError {
    #[error("slack rejected the credentials: {0}")]
    Auth(String),
    #[error("slack call {method} failed: {code}")]
    Call { method: String, code: String },
    #[error("slack transport failure: {0}")]
    Transport(String),
}

impl SlackError {
    pub fn is_auth(&self) -> bool {
        matches!(self, SlackError::Auth(_))
    }

    /// The error code for `Call` failures, empty otherwise.
    pub fn code(&self) -> &str {
        match self {
            SlackError::Call { code, .. } => code,
            _ => "",
        }
    }
}

pub struct Transport {
    http: reqwest::Client,
    cookie: Option<String>,
    token: String,
}

impl Transport {
    pub fn new(token: String, cookie: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("slackirc")
            .build()?;
        let cookie = cookie.map(|c| {
            if c.contains('=') {
                c
            } else {
                format!("d={c};")
            }
        });
        Ok(Self { http, cookie, token })
    }

    /// One Web API call. Transient failures (network, 5xx, rate limit)
    /// are retried here so upper layers only ever see terminal errors.
    pub async fn call(&self, method: &str, form: &[(&str, String)]) -> Result<Value, SlackError> {
        let mut delay = RETRY_BASE_DELAY;
        let mut last = String::new();
        for attempt in 1..=CALL_ATTEMPTS {
            let mut request = self
                .http
                .post(format!("{API_BASE}/{method}"))
                .bearer_auth(&self.token)
                .form(form);
            if let Some(cookie) = &self.cookie {
                request = request.header("Cookie", cookie);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.as_u16() == 429 {
                        let wait = response
                            .headers()
                            .get("Retry-After")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse::<u64>().ok())
                            .map(Duration::from_secs)
                            .unwrap_or(delay);
                        debug!("rate limited on {method}, waiting {wait:?}");
                        tokio::time::sleep(wait).await;
                        last = "rate limited".to_string();
                    } else if status.is_server_error() {
                        last = format!("server error {status}");
                        tokio::time::sleep(delay).await;
                    } else {
                        let value: Value = response.json().await.map_err(|err| {
                            SlackError::Transport(format!("{method} returned non-JSON: {err}"))
                        })?;
                        return self.check_envelope(method, value);
                    }
                }
                Err(err) => {
                    last = err.to_string();
                    tokio::time::sleep(delay).await;
                }
            }
            delay = (delay * 2).min(RECONNECT_MAX_DELAY);
            if attempt < CALL_ATTEMPTS {
                debug!("attempt {attempt}/{CALL_ATTEMPTS} for {method} failed, retrying");
            }
        }
        Err(SlackError::Transport(format!(
            "{method} failed after {CALL_ATTEMPTS} attempts: {last}"
        )))
    }

    /// Multipart upload for `files.upload`-style methods.
    pub async fn call_multipart(
        &self,
        method: &str,
        form: &[(&str, String)],
        filename: String,
        content: Vec<u8>,
    ) -> Result<Value, SlackError> {
        let mut multipart = reqwest::multipart::Form::new().part(
            "file",
            reqwest::multipart::Part::bytes(content).file_name(filename),
        );
        for (key, value) in form {
            multipart = multipart.text(key.to_string(), value.clone());
        }

        let mut request = self
            .http
            .post(format!("{API_BASE}/{method}"))
            .bearer_auth(&self.token)
            .multipart(multipart);
        if let Some(cookie) = &self.cookie {
            request = request.header("Cookie", cookie);
        }

        let response = request
            .send()
            .await
            .map_err(|err| SlackError::Transport(err.to_string()))?;
        let value: Value = response
            .json()
            .await
            .map_err(|err| SlackError::Transport(format!("{method} returned non-JSON: {err}")))?;
        self.check_envelope(method, value)
    }

    /// Authenticated GET for file attachments; `url_private` links need
    /// the same bearer token and cookie as API calls.
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, SlackError> {
        let mut request = self.http.get(url).bearer_auth(&self.token);
        if let Some(cookie) = &self.cookie {
            request = request.header("Cookie", cookie);
        }
        let response = request
            .send()
            .await
            .map_err(|err| SlackError::Transport(err.to_string()))?;
        if !response.status().is_success() {
            return Err(SlackError::Transport(format!(
                "download of {url} failed: {}",
                response.status()
            )));
        }
        response
            .bytes()
            .await
            .map(|bytes| bytes.to_vec())
            .map_err(|err| SlackError::Transport(err.to_string()))
    }

    fn check_envelope(&self, method: &str, value: Value) -> Result<Value, SlackError> {
        if value.get("ok").and_then(Value::as_bool).unwrap_or(false) {
            return Ok(value);
        }
        let code = value
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error")
            .to_string();
        if AUTH_ERRORS.contains(&code.as_str()) {
            return Err(SlackError::Auth(code));
        }
        Err(SlackError::Call {
            method: method.to_string(),
            code,
        })
    }

    fn cookie_header(&self) -> Option<HeaderValue> {
        self.cookie
            .as_deref()
            .and_then(|c| HeaderValue::from_str(c).ok())
    }
}

/// Frames delivered to the session layer. `Reconnected` is synthetic:
/// the socket dropped and came back, so rosters may have drifted and a
/// backfill is in order.
#[derive(Debug)]
pub enum RtmFrame {
    Event(Value),
    Reconnected,
    /// The socket cannot be re-established with these credentials.
    Fatal(SlackError),
}

pub struct RtmHandle {
    /// Frames the session wants on the wire (typing indicators).
    pub outbound: mpsc::Sender<Value>,
    task: JoinHandle<()>,
}

impl RtmHandle {
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for RtmHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Spawn the RTM socket task. It owns the connection for the lifetime
/// of the bridge session and reconnects on every kind of loss.
pub fn spawn_rtm(transport: std::sync::Arc<Transport>) -> (RtmHandle, mpsc::Receiver<RtmFrame>) {
    let (event_tx, event_rx) = mpsc::channel(256);
    let (out_tx, out_rx) = mpsc::channel(64);
    let task = tokio::spawn(rtm_loop(transport, event_tx, out_rx));
    (
        RtmHandle {
            outbound: out_tx,
            task,
        },
        event_rx,
    )
}

async fn rtm_loop(
    transport: std::sync::Arc<Transport>,
    events: mpsc::Sender<RtmFrame>,
    mut outbound: mpsc::Receiver<Value>,
) {
    let mut delay = RECONNECT_BASE_DELAY;
    let mut connected_before = false;

    loop {
        let url = match transport.call("rtm.connect", &[]).await {
            Ok(value) => match value.get("url").and_then(Value::as_str) {
                Some(url) => url.to_string(),
                None => {
                    warn!("rtm.connect response had no url");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(RECONNECT_MAX_DELAY);
                    continue;
                }
            },
            Err(err) if err.is_auth() => {
                let _ = events.send(RtmFrame::Fatal(err)).await;
                return;
            }
            Err(err) => {
                warn!("rtm.connect failed: {err}");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RECONNECT_MAX_DELAY);
                continue;
            }
        };

        let mut request = match url.as_str().into_client_request() {
            Ok(request) => request,
            Err(err) => {
                warn!("bad rtm url: {err}");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RECONNECT_MAX_DELAY);
                continue;
            }
        };
        if let Some(cookie) = transport.cookie_header() {
            request.headers_mut().insert("Cookie", cookie);
        }

        match connect_async(request).await {
            Ok((stream, _)) => {
                info!("slack event socket connected");
                delay = RECONNECT_BASE_DELAY;
                if connected_before {
                    if events.send(RtmFrame::Reconnected).await.is_err() {
                        return;
                    }
                }
                connected_before = true;
                if pump_socket(stream, &events, &mut outbound).await.is_err() {
                    // Receiver went away: the bridge session ended.
                    return;
                }
                info!("slack event socket lost, reconnecting");
            }
            Err(err) => {
                warn!("websocket connect failed: {err}");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RECONNECT_MAX_DELAY);
            }
        }
    }
}

/// Drive one socket until it drops. `Err` means the event receiver is
/// gone and the task should exit entirely.
async fn pump_socket(
    mut stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    events: &mpsc::Sender<RtmFrame>,
    outbound: &mut mpsc::Receiver<Value>,
) -> Result<(), ()> {
    let mut ping_id: u64 = 0;
    let mut ping = tokio::time::interval(RTM_PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = tokio::time::timeout(RTM_WATCHDOG, stream.next()) => {
                let frame = match frame {
                    Err(_) => {
                        warn!("no frame from slack in {RTM_WATCHDOG:?}");
                        return Ok(());
                    }
                    Ok(None) => return Ok(()),
                    Ok(Some(Err(err))) => {
                        warn!("socket frame error: {err}");
                        return Ok(());
                    }
                    Ok(Some(Ok(frame))) => frame,
                };
                match frame {
                    WsMessage::Text(text) => {
                        let value: Value = match serde_json::from_str(&text) {
                            Ok(value) => value,
                            Err(err) => {
                                debug!("dropping undecodable frame: {err}");
                                continue;
                            }
                        };
                        match value.get("type").and_then(Value::as_str) {
                            Some("goodbye") => {
                                info!("slack sent goodbye, cycling the socket");
                                return Ok(());
                            }
                            Some("pong") => {}
                            _ => {
                                if events.send(RtmFrame::Event(value)).await.is_err() {
                                    return Err(());
                                }
                            }
                        }
                    }
                    WsMessage::Ping(payload) => {
                        let _ = stream.send(WsMessage::Pong(payload)).await;
                    }
                    WsMessage::Close(_) => return Ok(()),
                    _ => {}
                }
            }
            _ = ping.tick() => {
                ping_id += 1;
                let frame = json!({"type": "ping", "id": ping_id});
                if stream.send(WsMessage::Text(frame.to_string().into())).await.is_err() {
                    return Ok(());
                }
            }
            sendable = outbound.recv() => {
                match sendable {
                    Some(value) => {
                        if stream
                            .send(WsMessage::Text(value.to_string().into()))
                            .await
                            .is_err()
                        {
                            return Ok(());
                        }
                    }
                    None => return Err(()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_cookie_value_is_wrapped() {
        let transport = Transport::new("xoxc-123".to_string(), Some("abc".to_string())).unwrap();
        assert_eq!(transport.cookie.as_deref(), Some("d=abc;"));
    }

    #[test]
    fn full_cookie_string_is_kept() {
        let transport =
            Transport::new("xoxc-123".to_string(), Some("d=abc; other=1".to_string())).unwrap();
        assert_eq!(transport.cookie.as_deref(), Some("d=abc; other=1"));
    }

    #[test]
    fn auth_error_codes_are_classified() {
        let transport = Transport::new("tok".to_string(), None).unwrap();
        let err = transport
            .check_envelope("auth.test", json!({"ok": false, "error": "invalid_auth"}))
            .unwrap_err();
        assert!(err.is_auth());
    }

    #[test]
    fn call_errors_carry_method_and_code() {
        let transport = Transport::new("tok".to_string(), None).unwrap();
        let err = transport
            .check_envelope("chat.postMessage", json!({"ok": false, "error": "channel_not_found"}))
            .unwrap_err();
        assert_eq!(err.code(), "channel_not_found");
        assert_eq!(
            err.to_string(),
            "slack call chat.postMessage failed: channel_not_found"
        );
    }

    #[test]
    fn ok_envelope_passes_through() {
        let transport = Transport::new("tok".to_string(), None).unwrap();
        let value = transport
            .check_envelope("auth.test", json!({"ok": true, "user_id": "U01"}))
            .unwrap();
        assert_eq!(value["user_id"], "U01");
    }
}

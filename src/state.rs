//! The status file: a small length-prefixed JSON document holding the
//! per-room read cursors and the rule tables, so a restart neither
//! replays nor loses history.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const SCHEMA_VERSION: u32 = 1;

/// How long a save may block shutdown before being abandoned.
const SAVE_DEADLINE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutoreactRule {
    /// Restrict to one room; `None` matches every room.
    pub room: Option<String>,
    pub probability: f64,
    pub reaction: String,
    /// Absolute expiry, unix seconds.
    pub expires: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Status {
    pub version: u32,
    /// Room id → newest delivered ts.
    #[serde(default)]
    pub last_seen: HashMap<String, String>,
    /// Target user id → absolute expiry, unix seconds.
    #[serde(default)]
    pub annoy: HashMap<String, i64>,
    #[serde(default)]
    pub autoreact: HashMap<String, Vec<AutoreactRule>>,
    /// Echo of the configured silenced-yellers list at save time.
    #[serde(default)]
    pub silenced_yellers: Vec<String>,
}

impl Status {
    pub fn new() -> Self {
        Self {
            version: SCHEMA_VERSION,
            ..Default::default()
        }
    }
}

fn decode(bytes: &[u8]) -> Result<Status> {
    if bytes.len() < 4 {
        bail!("status file too short for length prefix");
    }
    let declared = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let body = &bytes[4..];
    if body.len() < declared {
        bail!("status file truncated: {} of {} bytes", body.len(), declared);
    }
    let status: Status =
        serde_json::from_slice(&body[..declared]).context("status file is not valid JSON")?;
    if status.version != SCHEMA_VERSION {
        bail!("unsupported status schema version {}", status.version);
    }
    Ok(status)
}

fn encode(status: &Status) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(status).context("failed to serialize status")?;
    let mut out = Vec::with_capacity(body.len() + 4);
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Best-effort load. A missing or corrupt file warns and yields a fresh
/// status; it never stops startup.
pub async fn load(path: &Path) -> Status {
    match tokio::fs::read(path).await {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Status::new(),
        Err(err) => {
            warn!("could not read status file {}: {err}", path.display());
            Status::new()
        }
        Ok(bytes) => match decode(&bytes) {
            Ok(status) => status,
            Err(err) => {
                warn!(
                    "dropping unusable status file {}: {err}",
                    path.display()
                );
                Status::new()
            }
        },
    }
}

/// Write the status document, bounded so it can never hold up shutdown.
pub async fn save(path: &Path, status: &Status) {
    let bytes = match encode(status) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!("not saving status: {err}");
            return;
        }
    };
    match tokio::time::timeout(SAVE_DEADLINE, tokio::fs::write(path, bytes)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!("could not write status file {}: {err}", path.display()),
        Err(_) => warn!(
            "abandoned status file write to {} after {:?}",
            path.display(),
            SAVE_DEADLINE
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status");

        let mut status = Status::new();
        status
            .last_seen
            .insert("C01".to_string(), "1700000000.000100".to_string());
        status.annoy.insert("U07".to_string(), 1_900_000_000);
        status.autoreact.insert(
            "U08".to_string(),
            vec![AutoreactRule {
                room: Some("C01".to_string()),
                probability: 0.5,
                reaction: "+1".to_string(),
                expires: 1_900_000_000,
            }],
        );
        status.silenced_yellers.push("rose".to_string());

        save(&path, &status).await;
        assert_eq!(load(&path).await, status);
    }

    #[tokio::test]
    async fn missing_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let status = load(&dir.path().join("absent")).await;
        assert_eq!(status.version, SCHEMA_VERSION);
        assert!(status.last_seen.is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status");
        tokio::fs::write(&path, b"\x00\x00\x00\x05not json at all")
            .await
            .unwrap();
        let status = load(&path).await;
        assert!(status.last_seen.is_empty());
    }

    #[tokio::test]
    async fn truncated_prefix_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status");
        tokio::fs::write(&path, b"\xff\xff\xff\xff{}").await.unwrap();
        let status = load(&path).await;
        assert!(status.annoy.is_empty());
    }

    #[test]
    fn unknown_schema_version_is_rejected() {
        let mut status = Status::new();
        status.version = 99;
        let bytes = encode(&status).unwrap();
        assert!(decode(&bytes).is_err());
    }
}

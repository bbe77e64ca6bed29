//! Control/monitoring socket.
//!
//! A Unix stream socket speaking newline-delimited JSON records. `who`
//! returns the per-session stat records as one or more chunks, each
//! response serialized to at most the configured `control.max_msgsz`
//! octets; `disconnect-user` stops a user's sessions and reports how
//! many. Response status values are protocol integers, not process exit
//! codes.

use crate::server::SharedDaemon;
use crate::session::SessionRecord;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const STATUS_OK: u32 = 0;
pub const STATUS_BAD_REQUEST: u32 = 1;

/// Envelope octets reserved per chunk besides the session records
/// themselves.
const CHUNK_OVERHEAD: usize = 64;

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum ControlRequest {
    Who,
    DisconnectUser { username: String },
}

#[derive(Debug, Serialize)]
struct WhoChunk<'a> {
    status: u32,
    sessions: &'a [SessionRecord],
    /// More chunks follow this one.
    more: bool,
}

#[derive(Debug, Serialize)]
struct DisconnectReply {
    status: u32,
    count: usize,
}

#[derive(Debug, Serialize)]
struct ErrorReply {
    status: u32,
    error: String,
}

/// Split `records` into chunks whose serialized `WhoChunk` stays within
/// `max_msgsz`. A record too large on its own still travels alone; the
/// bound is best-effort, never a reason to drop a session from the
/// listing.
pub fn chunk_records(records: &[SessionRecord], max_msgsz: usize) -> Vec<&[SessionRecord]> {
    let budget = max_msgsz.saturating_sub(CHUNK_OVERHEAD).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut used = 0;
    for (i, record) in records.iter().enumerate() {
        let len = serde_json::to_string(record).map(|s| s.len() + 1).unwrap_or(1);
        if i > start && used + len > budget {
            chunks.push(&records[start..i]);
            start = i;
            used = 0;
        }
        used += len;
    }
    if start < records.len() {
        chunks.push(&records[start..]);
    }
    chunks
}

pub struct ControlServer {
    daemon: SharedDaemon,
    listener: UnixListener,
}

impl ControlServer {
    /// Bind the control socket, replacing a stale socket file.
    pub fn bind(daemon: SharedDaemon, path: &Path) -> std::io::Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        info!("control socket listening on {}", path.display());
        Ok(ControlServer { daemon, listener })
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.listener.accept().await {
                    Ok((stream, _)) => {
                        let daemon = self.daemon.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(daemon, stream).await {
                                debug!("control connection ended: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        warn!("control accept failed: {e}");
                    }
                }
            }
        })
    }
}

async fn handle_connection(daemon: SharedDaemon, stream: UnixStream) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ControlRequest>(&line) {
            Ok(ControlRequest::Who) => {
                let records = daemon.who().await;
                let max_msgsz = daemon.control_max_msgsz().await;
                let chunks = chunk_records(&records, max_msgsz);
                if chunks.is_empty() {
                    write_json(
                        &mut writer,
                        &WhoChunk {
                            status: STATUS_OK,
                            sessions: &[],
                            more: false,
                        },
                    )
                    .await?;
                }
                for (i, chunk) in chunks.iter().enumerate() {
                    write_json(
                        &mut writer,
                        &WhoChunk {
                            status: STATUS_OK,
                            sessions: chunk,
                            more: i + 1 < chunks.len(),
                        },
                    )
                    .await?;
                }
            }
            Ok(ControlRequest::DisconnectUser { username }) => {
                let count = daemon.disconnect_user(&username).await;
                info!("control: disconnect-user '{username}' stopped {count} sessions");
                write_json(
                    &mut writer,
                    &DisconnectReply {
                        status: STATUS_OK,
                        count,
                    },
                )
                .await?;
            }
            Err(e) => {
                write_json(
                    &mut writer,
                    &ErrorReply {
                        status: STATUS_BAD_REQUEST,
                        error: e.to_string(),
                    },
                )
                .await?;
            }
        }
    }
    Ok(())
}

async fn write_json<W, T>(writer: &mut W, value: &T) -> std::io::Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    writer.write_all(&line).await
}

//! Online recovery: a node rejoining the cluster asks a peer for a
//! snapshot of the store plus a tail of writes that land while the
//! snapshot is being streamed, so it does not need to stop accepting
//! traffic elsewhere while it catches up.
//!
//! Not present in the retrieved Go sources (no `RECOVER` handling exists
//! there); built from the specification's description of the protocol, in
//! the tokio/thiserror idiom used throughout the rest of this crate.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::store::lru::LruStore;
use crate::store::Store;
use crate::wire::{Command, Response};

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("io error during recovery: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected line during recovery: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, RecoveryError>;

/// How long to wait for another queued write before concluding the tail is
/// drained and sending the end-of-recovery sentinel.
const DRAIN_IDLE: Duration = Duration::from_millis(50);

/// Source side: called by the connection handler when it reads a `RECOVER`
/// command. Streams a consistent snapshot followed by a tail of writes that
/// arrive while the snapshot is being sent, then `RECOVEREND`.
///
/// The store's exclusive lock is held only across the snapshot read and the
/// write-recorder install, not across the whole transfer — holding it for
/// the full transfer would stall every other client on this node for as
/// long as recovery takes.
pub async fn serve_recover<W>(store: &LruStore, writer: &mut W) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let (snapshot, mut rx) = {
        let mut guard = store.lock();
        let snapshot = LruStore::snapshot_locked(&guard);
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        LruStore::start_recording_locked(&mut guard, tx);
        (snapshot, rx)
    };

    for (key, value) in snapshot {
        let line = Command::Set { key, value }.to_line();
        writer.write_all(format!("{line}\n").as_bytes()).await?;
    }

    loop {
        match tokio::time::timeout(DRAIN_IDLE, rx.recv()).await {
            Ok(Some(cmd)) => {
                writer.write_all(format!("{}\n", cmd.to_line()).as_bytes()).await?;
            }
            Ok(None) | Err(_) => break,
        }
    }
    store.stop_recording();

    writer
        .write_all(format!("{}\n", Response::RecoverEnd.to_line()).as_bytes())
        .await?;
    Ok(())
}

/// Destination side: dial `addr`, request recovery for `server_id`, and
/// apply every streamed command to `store` until `RECOVEREND` arrives.
pub async fn recover_from_peer(addr: &str, server_id: &str, store: &LruStore) -> Result<usize> {
    let stream = TcpStream::connect(addr).await?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let request = Command::Recover {
        server_id: server_id.to_string(),
    }
    .to_line();
    write_half.write_all(format!("{request}\n").as_bytes()).await?;

    let mut applied = 0usize;
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(RecoveryError::Protocol(
                "connection closed before RECOVEREND".into(),
            ));
        }
        let line = line.trim_end();
        if line == Response::RecoverEnd.to_line() {
            break;
        }
        match Command::parse(line) {
            Ok(Command::Set { key, value }) => {
                store.set(key, value);
                applied += 1;
            }
            Ok(Command::Delete { key }) => {
                store.delete(&key);
                applied += 1;
            }
            Ok(Command::Flush) => {
                store.flush();
                applied += 1;
            }
            other => {
                return Err(RecoveryError::Protocol(format!(
                    "unexpected recovery line: {other:?} ({line})"
                )));
            }
        }
    }
    log::info!("recovery from '{addr}' complete: {applied} entries applied");
    Ok(applied)
}

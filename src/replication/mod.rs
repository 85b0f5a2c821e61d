//! The replication pipeline: a single ordered dispatcher per primary that
//! forwards write events to every configured secondary, in order, re-dialing
//! and retrying once on a transient failure.
//!
//! Grounded in shape on `database::replication::ReplicationManager` (an
//! mpsc channel drained by a background task) and in exact per-secondary
//! retry semantics on the original Go `pkg/replication/replicator.go`
//! (`Replicator.replicateTask`: write, on error close + redial + retry once,
//! then check the peer replied `OK`). Unlike the teacher's manager, which
//! fans each event out via a fire-and-forget `tokio::spawn` per replica,
//! this dispatcher drains its queue strictly in order so secondaries never
//! observe writes out of sequence.
//!
//! The failure-path redial waits a fixed 2 seconds before its single retry,
//! matching the original `replicateTask`'s reconnect delay exactly (the
//! initial dial, by contrast, goes through the capped exponential backoff
//! used for every other outbound connection in this crate).

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;

use crate::wire::Command;

/// Fixed delay before the single re-dial attempt after a write failure.
const REDIAL_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("secondary '{0}' did not acknowledge the write")]
    NotAcknowledged(String),
    #[error("io error talking to secondary '{0}': {1}")]
    Io(String, std::io::Error),
}

pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Queue capacity for the dispatcher's inbound channel. Once full, callers
/// block on `send` rather than dropping writes — losing a write silently
/// would violate the store/replica consistency this pipeline exists for.
pub const QUEUE_CAPACITY: usize = 100;

/// A live connection to one secondary, with its read side wrapped in a
/// line-buffered reader for response checking.
struct PeerConn {
    addr: String,
    write_half: tokio::net::tcp::OwnedWriteHalf,
    reader: BufReader<OwnedReadHalf>,
}

impl PeerConn {
    async fn dial(addr: &str, keep_alive_interval: Duration) -> Result<Self> {
        let stream = crate::pool::dial_with_backoff(addr, keep_alive_interval)
            .await
            .map_err(|e| ReplicationError::Io(addr.to_string(), std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
        Self::from_stream(addr, stream)
    }

    /// Single-attempt direct connect, used for the fixed-delay redial after
    /// a write failure. Unlike [`PeerConn::dial`] this does not retry or
    /// back off further; the caller has already waited out [`REDIAL_DELAY`].
    async fn redial(addr: &str, keep_alive_interval: Duration) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ReplicationError::Io(addr.to_string(), e))?;
        let _ = stream.set_nodelay(true);
        crate::pool::apply_keepalive(&stream, keep_alive_interval);
        Self::from_stream(addr, stream)
    }

    fn from_stream(addr: &str, stream: TcpStream) -> Result<Self> {
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            addr: addr.to_string(),
            write_half,
            reader: BufReader::new(read_half),
        })
    }

    async fn send_and_check(&mut self, line: &str) -> Result<()> {
        self.write_half
            .write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(|e| ReplicationError::Io(self.addr.clone(), e))?;
        let mut resp = String::new();
        self.reader
            .read_line(&mut resp)
            .await
            .map_err(|e| ReplicationError::Io(self.addr.clone(), e))?;
        if resp.trim_end() != "OK" {
            return Err(ReplicationError::NotAcknowledged(self.addr.clone()));
        }
        Ok(())
    }
}

struct Secondary {
    id: String,
    addr: String,
    conn: Option<PeerConn>,
}

/// One secondary's replication target, as the caller assembles it from
/// config: the server id (matched against `RECOVER <id>` requests) and its
/// address.
#[derive(Debug, Clone)]
pub struct SecondarySpec {
    pub id: String,
    pub addr: String,
}

/// Owns the mpsc sender side; clone-able so every connection handler can
/// enqueue writes without sharing mutable state.
#[derive(Clone)]
pub struct ReplicatorHandle {
    tx: mpsc::Sender<Command>,
    drop_tx: mpsc::UnboundedSender<String>,
}

impl ReplicatorHandle {
    /// Enqueue a write event for replication. Blocks (does not drop) if the
    /// dispatcher is behind and the queue is full.
    pub async fn enqueue(&self, cmd: Command) {
        // The dispatcher task only exits when every sender (including this
        // one) is dropped, so `send` failing here would mean a logic bug,
        // not a runtime condition callers must handle.
        let _ = self.tx.send(cmd).await;
    }

    /// Drop the live connection to the secondary identified by `server_id`,
    /// if any, so the next write to it re-dials instead of landing on a
    /// connection that secondary may already consider abandoned (e.g.
    /// because it just finished recovering from a different peer).
    pub async fn drop_connection(&self, server_id: &str) {
        let _ = self.drop_tx.send(server_id.to_string());
    }
}

/// Drives the ordered per-primary write queue. Construct with
/// [`Replicator::spawn`], which starts the dispatcher task and returns a
/// cloneable handle for enqueuing writes.
pub struct Replicator;

impl Replicator {
    /// Spawn the dispatcher task for `secondaries` and return a handle
    /// connection handlers can use to enqueue writes and invalidate
    /// connections. `keep_alive_interval` is applied to every dialed socket.
    pub fn spawn(secondaries: Vec<SecondarySpec>, keep_alive_interval: Duration) -> ReplicatorHandle {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let (drop_tx, drop_rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::run(secondaries, rx, drop_rx, keep_alive_interval));
        ReplicatorHandle { tx, drop_tx }
    }

    async fn run(
        secondary_specs: Vec<SecondarySpec>,
        mut rx: mpsc::Receiver<Command>,
        mut drop_rx: mpsc::UnboundedReceiver<String>,
        keep_alive_interval: Duration,
    ) {
        let mut secondaries: Vec<Secondary> = secondary_specs
            .into_iter()
            .map(|spec| Secondary {
                id: spec.id,
                addr: spec.addr,
                conn: None,
            })
            .collect();

        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else {
                        log::info!("replication dispatcher shutting down: sender closed");
                        return;
                    };
                    let line = cmd.to_line();
                    for secondary in secondaries.iter_mut() {
                        if let Err(err) = Self::replicate_one(secondary, &line, keep_alive_interval).await {
                            log::warn!("replication to '{}' failed: {err}", secondary.addr);
                        }
                    }
                }
                Some(server_id) = drop_rx.recv() => {
                    if let Some(secondary) = secondaries.iter_mut().find(|s| s.id == server_id) {
                        if secondary.conn.take().is_some() {
                            log::info!("dropped replication connection to recovering '{server_id}'");
                        }
                    }
                }
            }
        }
    }

    /// Write `line` to `secondary`, dialing if needed. On I/O failure, wait
    /// [`REDIAL_DELAY`] and retry once with a fresh direct connection,
    /// exactly as the original `replicateTask` does.
    async fn replicate_one(secondary: &mut Secondary, line: &str, keep_alive_interval: Duration) -> Result<()> {
        if secondary.conn.is_none() {
            secondary.conn = Some(PeerConn::dial(&secondary.addr, keep_alive_interval).await?);
        }

        let first_attempt = {
            let conn = secondary.conn.as_mut().unwrap();
            conn.send_and_check(line).await
        };

        match first_attempt {
            Ok(()) => Ok(()),
            Err(_) => {
                tokio::time::sleep(REDIAL_DELAY).await;
                secondary.conn = Some(PeerConn::redial(&secondary.addr, keep_alive_interval).await?);
                let conn = secondary.conn.as_mut().unwrap();
                conn.send_and_check(line).await
            }
        }
    }
}

/// How long a client/node waits before considering a replica's ack missing
/// — used by callers that want a bounded replicate-and-wait, distinct from
/// the fire-and-forget `enqueue` path used by the connection handler.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(5);

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn replicates_in_order_to_single_secondary() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let received = std::sync::Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let received_clone = received.clone();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            loop {
                let mut line = String::new();
                let n = reader.read_line(&mut line).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                received_clone.lock().await.push(line.trim_end().to_string());
                let _ = write_half.write_all(b"OK\n").await;
            }
        });

        let handle = Replicator::spawn(
            vec![SecondarySpec { id: "node-b".into(), addr }],
            Duration::from_secs(30),
        );
        handle
            .enqueue(Command::Set {
                key: "a".into(),
                value: "1".into(),
            })
            .await;
        handle
            .enqueue(Command::Set {
                key: "b".into(),
                value: "2".into(),
            })
            .await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        let got = received.lock().await.clone();
        assert_eq!(got, vec!["SET a 1", "SET b 2"]);
    }

    #[tokio::test]
    async fn drop_connection_forces_new_accept_on_next_write() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let accepts = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let accepts_clone = accepts.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                accepts_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let (read_half, mut write_half) = stream.into_split();
                let mut reader = BufReader::new(read_half);
                loop {
                    let mut line = String::new();
                    let n = reader.read_line(&mut line).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    let _ = write_half.write_all(b"OK\n").await;
                }
            }
        });

        let handle = Replicator::spawn(
            vec![SecondarySpec { id: "node-b".into(), addr }],
            Duration::from_secs(30),
        );
        handle
            .enqueue(Command::Set { key: "a".into(), value: "1".into() })
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(accepts.load(std::sync::atomic::Ordering::SeqCst), 1);

        handle.drop_connection("node-b").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        handle
            .enqueue(Command::Set { key: "b".into(), value: "2".into() })
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(accepts.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}

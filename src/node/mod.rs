//! The cache node: a TCP server that applies wire commands against a local
//! store and forwards successful mutations to the replication pipeline.
//!
//! Grounded on `enterprise::cluster::transport::Transport::start`'s accept
//! loop (`listener.accept()` in a loop, `tokio::spawn` per connection) and,
//! for the per-connection command loop itself, the original Go
//! `pkg/server/server.go` `HandleConnection` (malformed command -> `ERROR:`
//! line and keep going; I/O error -> close the connection).

use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::replication::ReplicatorHandle;
use crate::store::lru::LruStore;
use crate::store::Store;
use crate::wire::{Command, Response};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {0}: {1}")]
    Bind(String, std::io::Error),
    #[error("accept failed: {0}")]
    Accept(std::io::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;

pub struct Server {
    store: Arc<LruStore>,
    replicator: Option<ReplicatorHandle>,
}

impl Server {
    pub fn new(store: Arc<LruStore>, replicator: Option<ReplicatorHandle>) -> Self {
        Self { store, replicator }
    }

    /// Bind `addr` and serve connections until `shutdown` fires.
    pub async fn serve(self: Arc<Self>, addr: &str, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind(addr.to_string(), e))?;
        log::info!("cachegopher node listening on {addr}");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted.map_err(ServerError::Accept)?;
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = this.handle_connection(stream).await {
                            log::warn!("connection from {peer} ended with error: {err}");
                        }
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        log::info!("shutdown signal received, no longer accepting connections");
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> std::io::Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();

        loop {
            line.clear();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                return Ok(());
            }
            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed.is_empty() {
                continue;
            }

            match Command::parse(trimmed) {
                Ok(Command::Recover { server_id }) => {
                    log::info!("serving recovery stream to '{server_id}'");
                    if let Some(replicator) = &self.replicator {
                        // Force the next write to this secondary to re-dial rather
                        // than land on a connection the secondary is about to
                        // abandon for the one it just reconnected with.
                        replicator.drop_connection(&server_id).await;
                    }
                    crate::recovery::serve_recover(&self.store, &mut write_half)
                        .await
                        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
                    continue;
                }
                Ok(Command::Exit) => {
                    write_half
                        .write_all(format!("{}\n", Response::Goodbye.to_line()).as_bytes())
                        .await?;
                    return Ok(());
                }
                Ok(Command::Keys) => {
                    let keys = self.store.keys();
                    if keys.is_empty() {
                        write_half.write_all(b"No keys found\n").await?;
                    } else {
                        for key in keys {
                            write_half.write_all(format!("{key}\n").as_bytes()).await?;
                        }
                    }
                }
                Ok(cmd) => {
                    let response = self.apply(cmd).await;
                    write_half
                        .write_all(format!("{}\n", response.to_line()).as_bytes())
                        .await?;
                }
                Err(err) => {
                    write_half
                        .write_all(format!("{}\n", Response::Error(err.to_string()).to_line()).as_bytes())
                        .await?;
                }
            }
        }
    }

    async fn apply(&self, cmd: Command) -> Response {
        match cmd {
            Command::Set { key, value } => {
                self.store.set(key.clone(), value.clone());
                if let Some(replicator) = &self.replicator {
                    replicator.enqueue(Command::Set { key, value }).await;
                }
                Response::Ok
            }
            Command::Get { key } => match self.store.get(&key) {
                Some(value) => Response::Value(value),
                None => Response::KeyNotFound,
            },
            Command::Delete { key } => {
                let existed = self.store.delete(&key);
                if existed {
                    if let Some(replicator) = &self.replicator {
                        replicator.enqueue(Command::Delete { key }).await;
                    }
                    Response::Ok
                } else {
                    Response::NoSuchKey
                }
            }
            Command::Flush => {
                self.store.flush();
                Response::Ok
            }
            Command::Ping => Response::Pong,
            Command::Keys | Command::Exit | Command::Recover { .. } => {
                unreachable!("handled before apply()")
            }
        }
    }
}

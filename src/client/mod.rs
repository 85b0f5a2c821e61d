//! Client facade: shards keys across primaries via the consistent hash
//! ring, routes writes to the owning primary, and load-balances reads
//! across a shard's primary + secondaries with health blacklisting.
//!
//! Grounded on the original Go `pkg/client/client.go` (`ConnPool` +
//! `sendCommand` building a command line, writing it, and scanning one
//! response line) combined with `pkg/client/hashing.go` (ring lookup,
//! per-node `Unhealthy`/`RetryAt` tracking).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::balancer::{BalancerError, ReadBalancer};
use crate::hashring::{Ring, RingError, RingNode};
use crate::pool::ConnPool;
use crate::wire::{Command, Response};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("key not found")]
    KeyNotFound,
    #[error(transparent)]
    Ring(#[from] RingError),
    #[error(transparent)]
    Balancer(#[from] BalancerError),
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// One shard: the primary that owns writes, plus a read balancer and a
/// connection pool per member (primary included, so reads can land there
/// too).
struct ShardGroup {
    balancer: ReadBalancer,
    pools: HashMap<String, Arc<ConnPool>>,
    primary_addr: String,
}

pub struct Client {
    ring: Ring,
    groups: HashMap<String, ShardGroup>,
    unhealthy_cooldown: Duration,
}

/// One shard's topology, as the caller assembles it from config: a primary
/// id/address and the addresses of its secondaries (which also serve
/// reads).
pub struct ShardSpec {
    pub id: String,
    pub primary_addr: String,
    pub secondary_addrs: Vec<String>,
    pub pool_size: usize,
    pub connection_timeout: Duration,
    pub keep_alive_interval: Duration,
}

impl Client {
    pub fn new(shards: Vec<ShardSpec>, unhealthy_cooldown: Duration) -> Self {
        let mut ring = Ring::new();
        let mut groups = HashMap::new();

        for shard in shards {
            ring.add_node(RingNode::new(shard.id.clone(), shard.primary_addr.clone()));

            let mut pools = HashMap::new();
            pools.insert(
                shard.primary_addr.clone(),
                Arc::new(ConnPool::new(
                    shard.primary_addr.clone(),
                    shard.pool_size,
                    shard.connection_timeout,
                    shard.keep_alive_interval,
                )),
            );
            let mut member_addrs = vec![shard.primary_addr.clone()];
            for secondary in &shard.secondary_addrs {
                pools.insert(
                    secondary.clone(),
                    Arc::new(ConnPool::new(
                        secondary.clone(),
                        shard.pool_size,
                        shard.connection_timeout,
                        shard.keep_alive_interval,
                    )),
                );
                member_addrs.push(secondary.clone());
            }

            groups.insert(
                shard.id,
                ShardGroup {
                    balancer: ReadBalancer::new(member_addrs),
                    pools,
                    primary_addr: shard.primary_addr,
                },
            );
        }

        Self {
            ring,
            groups,
            unhealthy_cooldown,
        }
    }

    fn group_for(&self, key: &str) -> Result<&ShardGroup> {
        let node = self.ring.node_for(key)?;
        self.groups
            .get(&node.id)
            .ok_or_else(|| ClientError::Protocol(format!("no shard group for node '{}'", node.id)))
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        let group = self.group_for(key)?;
        let pool = group
            .pools
            .get(&group.primary_addr)
            .expect("primary pool always present");
        let resp = send(
            pool,
            &Command::Set {
                key: key.to_string(),
                value: value.to_string(),
            },
        )
        .await?;
        match resp {
            Response::Ok => Ok(()),
            other => Err(ClientError::Protocol(format!("unexpected response to SET: {other:?}"))),
        }
    }

    pub async fn get(&self, key: &str) -> Result<String> {
        let group = self.group_for(key)?;
        let attempts = group.balancer.len().max(1);
        let mut last_err = None;

        for _ in 0..attempts {
            let addr = group.balancer.next()?.to_string();
            let pool = group.pools.get(&addr).expect("balancer only yields known addrs");
            match send(pool, &Command::Get { key: key.to_string() }).await {
                Ok(Response::Value(v)) => return Ok(v),
                Ok(Response::KeyNotFound) => return Err(ClientError::KeyNotFound),
                Ok(other) => {
                    last_err = Some(ClientError::Protocol(format!(
                        "unexpected response to GET: {other:?}"
                    )));
                }
                Err(err) => {
                    group.balancer.mark_unhealthy(&addr, self.unhealthy_cooldown);
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or(ClientError::Protocol("no nodes available".into())))
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let group = self.group_for(key)?;
        let pool = group
            .pools
            .get(&group.primary_addr)
            .expect("primary pool always present");
        match send(pool, &Command::Delete { key: key.to_string() }).await? {
            Response::Ok => Ok(()),
            Response::NoSuchKey => Err(ClientError::KeyNotFound),
            other => Err(ClientError::Protocol(format!("unexpected response to DELETE: {other:?}"))),
        }
    }
}

async fn send(pool: &ConnPool, cmd: &Command) -> Result<Response> {
    let mut stream = pool.acquire().await.map_err(|e| {
        ClientError::Transport(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    })?;
    stream.write_all(format!("{}\n", cmd.to_line()).as_bytes()).await?;

    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(ClientError::Transport(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed before a response line",
        )));
    }

    let stream = write_half.reunite(reader.into_inner()).map_err(|e| {
        ClientError::Transport(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    })?;
    pool.release(stream).await;

    parse_response(line.trim_end())
}

fn parse_response(line: &str) -> Result<Response> {
    Ok(match line {
        "OK" => Response::Ok,
        "PONG" => Response::Pong,
        "Goodbye!" => Response::Goodbye,
        "RECOVEREND" => Response::RecoverEnd,
        // These two carry specific client-facing meaning (see `ClientError::KeyNotFound`)
        // and must never fall through to the generic `ERROR:` case below.
        "ERROR: Key not found" => Response::KeyNotFound,
        "ERROR: No such key" => Response::NoSuchKey,
        other if other.starts_with("ERROR:") => {
            Response::Error(other.trim_start_matches("ERROR:").trim().to_string())
        }
        other => Response::Value(other.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn echo_server(behavior: impl Fn(&str) -> String + Send + Sync + 'static) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let behavior = &behavior;
                let (read_half, mut write_half) = stream.into_split();
                let mut reader = BufReader::new(read_half);
                loop {
                    let mut line = String::new();
                    let n = reader.read_line(&mut line).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    let resp = behavior(line.trim_end());
                    if write_half.write_all(format!("{resp}\n").as_bytes()).await.is_err() {
                        break;
                    }
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn set_and_get_round_trip_through_single_shard() {
        let store = Arc::new(parking_lot::Mutex::new(HashMap::<String, String>::new()));
        let store_clone = store.clone();
        let addr = echo_server(move |line| {
            let mut parts = line.splitn(3, ' ');
            match parts.next() {
                Some("SET") => {
                    let key = parts.next().unwrap().to_string();
                    let value = parts.next().unwrap().to_string();
                    store_clone.lock().insert(key, value);
                    "OK".to_string()
                }
                Some("GET") => {
                    let key = parts.next().unwrap();
                    match store_clone.lock().get(key) {
                        Some(v) => v.clone(),
                        None => "ERROR: Key not found".to_string(),
                    }
                }
                _ => "ERROR: unknown".to_string(),
            }
        })
        .await;

        let client = Client::new(
            vec![ShardSpec {
                id: "shard-a".into(),
                primary_addr: addr,
                secondary_addrs: vec![],
                pool_size: 4,
                connection_timeout: Duration::from_secs(5),
                keep_alive_interval: Duration::from_secs(30),
            }],
            Duration::from_secs(10),
        );

        client.set("k", "v").await.unwrap();
        assert_eq!(client.get("k").await.unwrap(), "v");
    }

    #[test]
    fn parses_known_response_lines() {
        assert_eq!(parse_response("OK").unwrap(), Response::Ok);
        assert_eq!(parse_response("ERROR: Key not found").unwrap(), Response::KeyNotFound);
        assert_eq!(parse_response("ERROR: No such key").unwrap(), Response::NoSuchKey);
        assert_eq!(parse_response("Goodbye!").unwrap(), Response::Goodbye);
        assert_eq!(parse_response("hello world").unwrap(), Response::Value("hello world".into()));
    }
}

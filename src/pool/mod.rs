//! Per-peer connection pool with age-based expiry and capped exponential
//! backoff dialing.
//!
//! Grounded on `enterprise::cluster::transport::ConnectionPool`: keep a
//! small set of reusable connections and drop ones that have gone stale.
//! Dialing adds the backoff/retry policy from the original Go client's
//! redial-once-then-fail behavior, generalized to a capped exponential
//! schedule per the specification.

use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to connect to {addr} after {attempts} attempts: {source}")]
    DialFailed {
        addr: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("connect to {0} timed out")]
    Timeout(String),
}

pub type Result<T> = std::result::Result<T, PoolError>;

const BASE_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(1);
const MAX_ATTEMPTS: u32 = 3;
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Apply TCP keep-alive to `stream` using the configured probe interval,
/// matching the `keepAliveInterval` every deployed node's config carries.
pub(crate) fn apply_keepalive(stream: &TcpStream, keep_alive_interval: Duration) {
    let params = socket2::TcpKeepalive::new()
        .with_time(keep_alive_interval)
        .with_interval(keep_alive_interval);
    let _ = socket2::SockRef::from(stream).set_tcp_keepalive(&params);
}

pub(crate) async fn dial_with_backoff(addr: &str, keep_alive_interval: Duration) -> Result<TcpStream> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                apply_keepalive(&stream, keep_alive_interval);
                return Ok(stream);
            }
            Ok(Err(err)) => {
                if attempt >= MAX_ATTEMPTS {
                    return Err(PoolError::DialFailed {
                        addr: addr.to_string(),
                        attempts: attempt,
                        source: err,
                    });
                }
            }
            Err(_) => {
                if attempt >= MAX_ATTEMPTS {
                    return Err(PoolError::Timeout(addr.to_string()));
                }
            }
        }
        let backoff = BASE_BACKOFF
            .saturating_mul(1 << (attempt - 1))
            .min(MAX_BACKOFF);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=100));
        tokio::time::sleep(backoff + jitter).await;
    }
}

struct Pooled {
    stream: TcpStream,
    created_at: Instant,
}

/// A pool of reusable connections to a single peer address.
pub struct ConnPool {
    addr: String,
    max_size: usize,
    max_age: Duration,
    keep_alive_interval: Duration,
    conns: tokio::sync::Mutex<Vec<Pooled>>,
}

impl ConnPool {
    pub fn new(addr: impl Into<String>, max_size: usize, max_age: Duration, keep_alive_interval: Duration) -> Self {
        Self {
            addr: addr.into(),
            max_size,
            max_age,
            keep_alive_interval,
            conns: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Acquire a connection: reuse a fresh pooled one if available, else
    /// dial a new one.
    pub async fn acquire(&self) -> Result<TcpStream> {
        {
            let mut conns = self.conns.lock().await;
            conns.retain(|c| c.created_at.elapsed() < self.max_age);
            if let Some(pooled) = conns.pop() {
                return Ok(pooled.stream);
            }
        }
        dial_with_backoff(&self.addr, self.keep_alive_interval).await
    }

    /// Return a connection to the pool for reuse, unless it's already
    /// stale or the pool is full (in which case it is simply dropped).
    pub async fn release(&self, stream: TcpStream) {
        let mut conns = self.conns.lock().await;
        if conns.len() < self.max_size {
            conns.push(Pooled {
                stream,
                created_at: Instant::now(),
            });
        }
        // else: drop it, closing the socket.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn acquires_and_releases() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });

        let pool = ConnPool::new(addr, 4, Duration::from_secs(30), Duration::from_secs(30));
        let conn = pool.acquire().await.unwrap();
        pool.release(conn).await;
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn dial_failure_reports_error() {
        // Port 1 is reserved and will refuse immediately most environments.
        let result = dial_with_backoff("127.0.0.1:1", Duration::from_secs(30)).await;
        assert!(result.is_err());
    }
}

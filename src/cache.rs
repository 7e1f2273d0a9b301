use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{info, warn};

const QUERY_COUNT_KEY: &str = "dns:query_count";
const HIT_COUNT_KEY: &str = "dns:hit_count";
const STARTUP_KEY: &str = "dns:startup";

/// Read-through response cache in front of the forwarder.
///
/// Every operation is best-effort: a missing or failing backend turns
/// reads into misses and writes into silent no-ops, and the query path
/// keeps working exactly as if nothing were cached.
#[async_trait]
pub trait CacheStore {
    /// Whether the backend accepted a liveness probe at init.
    fn ready(&self) -> bool;

    /// The last cached response for the name, or `None` if absent,
    /// expired, or the backend is unavailable.
    async fn get(&self, domain: &str) -> Option<Vec<u8>>;

    async fn put(&self, domain: &str, response: &[u8], ttl: Duration);

    async fn incr_queries(&self);

    async fn incr_hits(&self);
}

/// Cache client backed by a Redis-compatible key/value store. Response
/// payloads are stored as base64 text under `dns:<lowercase domain>`.
pub struct RedisCache {
    connection: Option<MultiplexedConnection>,
}

impl RedisCache {
    /// Probe the backend once at startup. On any failure the client is
    /// constructed disabled and the process runs without a cache.
    pub async fn connect(host: &str, port: u16) -> RedisCache {
        match Self::try_connect(host, port).await {
            Ok(connection) => {
                info!(host, port, "cache backend connected");
                RedisCache {
                    connection: Some(connection),
                }
            }
            Err(err) => {
                warn!(host, port, %err, "cache backend unavailable, continuing without cache");
                RedisCache { connection: None }
            }
        }
    }

    /// A client with no backend; every operation is a no-op or miss.
    pub fn disabled() -> RedisCache {
        RedisCache { connection: None }
    }

    async fn try_connect(host: &str, port: u16) -> redis::RedisResult<MultiplexedConnection> {
        let client = redis::Client::open(format!("redis://{host}:{port}/"))?;
        let mut connection = client.get_multiplexed_tokio_connection().await?;

        let pong: String = redis::cmd("PING").query_async(&mut connection).await?;
        if pong != "PONG" {
            return Err(redis::RedisError::from((
                redis::ErrorKind::ResponseError,
                "unexpected PING reply",
            )));
        }

        let started = chrono::Utc::now().to_rfc3339();
        let _: () = connection.set(STARTUP_KEY, started).await?;

        Ok(connection)
    }

    fn key(domain: &str) -> String {
        format!("dns:{}", domain.to_ascii_lowercase())
    }

    async fn incr(&self, key: &str) {
        let Some(connection) = &self.connection else {
            return;
        };
        let mut connection = connection.clone();
        if let Err(err) = connection.incr::<_, _, ()>(key, 1).await {
            warn!(key, %err, "cache counter increment failed");
        }
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    fn ready(&self) -> bool {
        self.connection.is_some()
    }

    async fn get(&self, domain: &str) -> Option<Vec<u8>> {
        let connection = self.connection.as_ref()?;
        let mut connection = connection.clone();

        let value: Option<String> = match connection.get(Self::key(domain)).await {
            Ok(value) => value,
            Err(err) => {
                warn!(domain, %err, "cache read failed, treating as miss");
                return None;
            }
        };

        match STANDARD.decode(value?) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                warn!(domain, %err, "cached value is not valid base64, treating as miss");
                None
            }
        }
    }

    async fn put(&self, domain: &str, response: &[u8], ttl: Duration) {
        let Some(connection) = &self.connection else {
            return;
        };
        let mut connection = connection.clone();

        let key = Self::key(domain);
        let value = STANDARD.encode(response);
        if let Err(err) = connection.set::<_, _, ()>(&key, value).await {
            warn!(domain, %err, "cache write failed");
            return;
        }
        if let Err(err) = connection.expire::<_, ()>(&key, ttl.as_secs() as i64).await {
            warn!(domain, %err, "cache expiry failed");
        }
    }

    async fn incr_queries(&self) {
        self.incr(QUERY_COUNT_KEY).await;
    }

    async fn incr_hits(&self) {
        self.incr(HIT_COUNT_KEY).await;
    }
}

/// In-memory stand-in used by tests that need to observe hit paths and
/// counters without a backend.
#[cfg(test)]
pub struct MemoryCache {
    entries: parking_lot::Mutex<std::collections::HashMap<String, Vec<u8>>>,
    queries: std::sync::atomic::AtomicU64,
    hits: std::sync::atomic::AtomicU64,
}

#[cfg(test)]
impl MemoryCache {
    pub fn new() -> MemoryCache {
        MemoryCache {
            entries: parking_lot::Mutex::new(std::collections::HashMap::new()),
            queries: std::sync::atomic::AtomicU64::new(0),
            hits: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn queries(&self) -> u64 {
        self.queries.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(test)]
#[async_trait]
impl CacheStore for MemoryCache {
    fn ready(&self) -> bool {
        true
    }

    async fn get(&self, domain: &str) -> Option<Vec<u8>> {
        self.entries.lock().get(&domain.to_ascii_lowercase()).cloned()
    }

    async fn put(&self, domain: &str, response: &[u8], _ttl: Duration) {
        self.entries
            .lock()
            .insert(domain.to_ascii_lowercase(), response.to_vec());
    }

    async fn incr_queries(&self) {
        self.queries
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    async fn incr_hits(&self) {
        self.hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
}

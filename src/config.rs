use std::env;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Budget for a single upstream attempt before failing over.
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Fixed TTL for cached responses, regardless of the answer's own TTLs.
pub const CACHE_TTL: Duration = Duration::from_secs(300);

/// Pending entries older than this are definitionally lost: the attempt
/// budget is 5 s and the pool is small, so a healthy request resolves
/// well under 30 s.
pub const STALE_THRESHOLD: Duration = Duration::from_secs(30);

pub const SWEEP_PERIOD: Duration = Duration::from_secs(60);
pub const STATS_PERIOD: Duration = Duration::from_secs(300);

/// One endpoint of the ordered upstream pool.
#[derive(Debug, Clone)]
pub struct Upstream {
    pub ip: IpAddr,
    pub port: u16,
    pub name: String,
}

impl Upstream {
    pub fn new(ip: IpAddr, port: u16, name: &str) -> Upstream {
        Upstream {
            ip,
            port,
            name: name.to_string(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.addr(), self.name)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: IpAddr,
    pub dns_port: u16,
    pub redis_host: String,
    pub redis_port: u16,
    /// Informational only; anything other than "production" is development.
    pub production: bool,
    pub upstreams: Vec<Upstream>,
}

impl Config {
    pub fn from_env() -> Config {
        Config {
            bind_address: env_parse("BIND_ADDRESS", IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            dns_port: env_parse("DNS_PORT", 8053),
            redis_host: env::var("REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            redis_port: env_parse("REDIS_PORT", 6379),
            production: matches!(env::var("APP_ENV").as_deref(), Ok("production")),
            upstreams: default_pool(),
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.dns_port)
    }
}

/// The ordered pool walked on fail-over. Entries can be added here without
/// touching anything else.
pub fn default_pool() -> Vec<Upstream> {
    vec![
        Upstream::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53, "Google"),
        Upstream::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 53, "Cloudflare"),
        Upstream::new(IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)), 53, "Quad9"),
    ]
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(value) => match value.parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(key, value, "unparseable environment variable, using default");
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pool_is_ordered() {
        let pool = default_pool();
        assert_eq!(pool.len(), 3);
        assert_eq!(pool[0].addr(), "8.8.8.8:53".parse().unwrap());
        assert_eq!(pool[1].addr(), "1.1.1.1:53".parse().unwrap());
        assert_eq!(pool[2].addr(), "9.9.9.9:53".parse().unwrap());
    }

    #[test]
    fn upstream_display_names_endpoint() {
        let upstream = Upstream::new(IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)), 53, "Quad9");
        assert_eq!(upstream.to_string(), "9.9.9.9:53 (Quad9)");
    }

    #[test]
    fn env_parse_missing_uses_default() {
        assert_eq!(env_parse("DNSRELAY_TEST_UNSET_PORT", 8053u16), 8053);
    }

    #[test]
    fn env_parse_garbage_uses_default() {
        env::set_var("DNSRELAY_TEST_GARBAGE_PORT", "not-a-port");
        assert_eq!(env_parse("DNSRELAY_TEST_GARBAGE_PORT", 8053u16), 8053);
        env::remove_var("DNSRELAY_TEST_GARBAGE_PORT");
    }
}

use crate::cache::CacheStore;
use crate::config::{STALE_THRESHOLD, STATS_PERIOD, SWEEP_PERIOD};
use crate::forwarder::Forwarder;
use crate::local;
use crate::protocol::{self, MAX_PACKET_SIZE};
use crate::table::RequestTable;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{info, trace, warn};

pub struct Server<C>(Arc<Inner<C>>);

struct Inner<C> {
    socket: Arc<UdpSocket>,
    cache: Arc<C>,
    table: Arc<RequestTable>,
    forwarder: Arc<Forwarder<C>>,
}

impl<C> Server<C>
where
    C: CacheStore + Send + Sync + 'static,
{
    pub fn new(
        socket: Arc<UdpSocket>,
        cache: Arc<C>,
        table: Arc<RequestTable>,
        forwarder: Arc<Forwarder<C>>,
    ) -> Server<C> {
        Server(Arc::new(Inner {
            socket,
            cache,
            table,
            forwarder,
        }))
    }

    /// Sole reader of the listening socket. The forwarder writes replies
    /// to the same socket concurrently with these reads.
    pub async fn run(&self) -> io::Result<()> {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        loop {
            let (size, origin) = self.0.socket.recv_from(&mut buf).await?;
            self.handle_datagram(&buf[0..size], origin);
        }
    }

    fn handle_datagram(&self, bytes: &[u8], origin: SocketAddr) {
        let Some(client_id) = protocol::read_id(bytes) else {
            info!(%origin, "truncated datagram, dropping");
            return;
        };
        let Some(domain) = protocol::extract_qname(bytes) else {
            info!(%origin, "malformed query, dropping");
            return;
        };

        trace!(%domain, %origin, "received query");

        let inner = Arc::clone(&self.0);
        let packet = bytes.to_vec();
        tokio::spawn(async move {
            inner.handle_query(packet, origin, client_id, domain).await;
        });
    }

    /// Start the two jobs that run for the life of the process: the
    /// stale-entry sweeper and the stats line.
    pub fn spawn_periodic_jobs(&self) {
        let inner = Arc::clone(&self.0);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_PERIOD);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let swept = inner.table.sweep(STALE_THRESHOLD);
                if swept > 0 {
                    info!(swept, "reaped stale pending requests");
                }
            }
        });

        let inner = Arc::clone(&self.0);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATS_PERIOD);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let (pending, _) = inner.table.stats();
                info!(
                    pending,
                    cache_ready = inner.cache.ready(),
                    sticky_upstream = inner.forwarder.sticky_index(),
                    "resolver stats"
                );
            }
        });
    }
}

impl<C> Inner<C>
where
    C: CacheStore + Send + Sync + 'static,
{
    async fn handle_query(
        self: Arc<Self>,
        packet: Vec<u8>,
        origin: SocketAddr,
        client_id: protocol::ID,
        domain: String,
    ) {
        info!("Query {} from {}", domain, origin.ip());

        self.cache.incr_queries().await;

        if let Some(reply) = local::synthesize(&packet) {
            trace!(%domain, "synthesized local answer");
            if let Err(err) = self.socket.send_to(&reply, origin).await {
                warn!(%err, "failed to send local answer");
            }
            return;
        }

        if let Some(mut cached) = self.cache.get(&domain).await {
            protocol::write_id(&mut cached, client_id);
            match self.socket.send_to(&cached, origin).await {
                Ok(_) => {
                    info!("Cache hit {}", domain);
                    self.cache.incr_hits().await;
                }
                Err(err) => warn!(%err, "failed to send cached reply"),
            }
            return;
        }

        self.forwarder
            .forward(&packet, origin, client_id, &domain)
            .await;
    }
}

use crate::cache::CacheStore;
use crate::config::{Upstream, CACHE_TTL};
use crate::protocol::{self, ID, MAX_PACKET_SIZE};
use crate::table::{InsertError, PendingRequest, RequestTable};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, info, trace, warn};

/// Routes cache misses to the upstream pool and replies back to clients.
///
/// Each miss runs an attempt sequence starting at the sticky index and
/// walking forward through the pool. An attempt owns a fresh ephemeral
/// socket, a pending-table entry, and a 5-second budget; whichever of
/// reply, deadline, or socket error arrives first also releases both.
pub struct Forwarder<C> {
    /// The main listening socket. Replies are written here concurrently
    /// with the server loop's reads.
    socket: Arc<UdpSocket>,
    table: Arc<RequestTable>,
    cache: Arc<C>,
    upstreams: Vec<Upstream>,
    /// Pool index of the last endpoint that produced a reply. New queries
    /// start here, biasing toward what worked without per-endpoint health
    /// bookkeeping.
    sticky: AtomicUsize,
    attempt_timeout: Duration,
}

enum Attempt {
    Answered,
    Failed,
}

impl<C: CacheStore + Send + Sync + 'static> Forwarder<C> {
    pub fn new(
        socket: Arc<UdpSocket>,
        table: Arc<RequestTable>,
        cache: Arc<C>,
        upstreams: Vec<Upstream>,
        attempt_timeout: Duration,
    ) -> Forwarder<C> {
        Forwarder {
            socket,
            table,
            cache,
            upstreams,
            sticky: AtomicUsize::new(0),
            attempt_timeout,
        }
    }

    pub fn sticky_index(&self) -> usize {
        self.sticky.load(Ordering::Relaxed)
    }

    /// Run the attempt sequence for one client query. The walk does not
    /// wrap: endpoints before the sticky index are not retried for this
    /// query. When the pool is exhausted the query is dropped without a
    /// reply; clients retry at their own layer.
    pub async fn forward(&self, query: &[u8], origin: SocketAddr, client_id: ID, domain: &str) {
        let mut index = self.sticky.load(Ordering::Relaxed);

        while index < self.upstreams.len() {
            match self.attempt(query, origin, client_id, domain, index).await {
                Ok(Attempt::Answered) => {
                    self.sticky.store(index, Ordering::Relaxed);
                    return;
                }
                Ok(Attempt::Failed) => {}
                Err(err) => {
                    info!(upstream = %self.upstreams[index], %err, "upstream attempt failed");
                }
            }
            index += 1;
        }

        warn!(domain, client = %origin, "no upstream answered, dropping query");
    }

    async fn attempt(
        &self,
        query: &[u8],
        origin: SocketAddr,
        client_id: ID,
        domain: &str,
        index: usize,
    ) -> io::Result<Attempt> {
        let entry = self.register(origin, client_id, domain);

        trace!(
            upstream = %self.upstreams[index],
            fingerprint = %entry.fingerprint,
            upstream_id = entry.upstream_query_id,
            "forwarding query"
        );

        match self.exchange(query, &entry, &self.upstreams[index]).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.table.remove(&entry.fingerprint);
                Err(err)
            }
        }
    }

    /// Allocate a collision-free upstream ID and record the pending entry.
    /// Insertion rejects the losing side if two allocations race to the
    /// same ID, so losing just means allocating again.
    fn register(&self, origin: SocketAddr, client_id: ID, domain: &str) -> PendingRequest {
        loop {
            let request = PendingRequest {
                client_addr: origin,
                client_query_id: client_id,
                upstream_query_id: self.table.alloc_id(),
                domain: domain.to_string(),
                fingerprint: protocol::fingerprint(&origin, client_id, domain),
                created_at: Instant::now(),
            };
            match self.table.insert(request.clone()) {
                Ok(()) => return request,
                Err(InsertError::DuplicateUpstreamId) | Err(InsertError::DuplicateFingerprint) => {
                    trace!("pending entry collided, reallocating");
                }
            }
        }
    }

    async fn exchange(
        &self,
        query: &[u8],
        entry: &PendingRequest,
        upstream: &Upstream,
    ) -> io::Result<Attempt> {
        let mut packet = query.to_vec();
        protocol::write_id(&mut packet, entry.upstream_query_id);

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(upstream.addr()).await?;

        let deadline = Instant::now() + self.attempt_timeout;
        socket.send(&packet).await?;

        let mut buf = [0u8; MAX_PACKET_SIZE];
        loop {
            let received = match timeout_at(deadline, socket.recv(&mut buf)).await {
                Ok(result) => result?,
                Err(_elapsed) => {
                    self.table.remove(&entry.fingerprint);
                    info!(
                        upstream = %upstream,
                        domain = %entry.domain,
                        "upstream attempt timed out"
                    );
                    return Ok(Attempt::Failed);
                }
            };

            let mut reply = buf[..received].to_vec();
            match self.dispatch_reply(&mut reply).await {
                Some(delivered) if delivered.fingerprint == entry.fingerprint => {
                    return Ok(Attempt::Answered);
                }
                // The datagram answered some other pending exchange; ours
                // is still in flight, keep waiting.
                Some(_) => continue,
                None => {
                    // Orphan on this attempt's socket. Close it and let the
                    // rest of the budget elapse; if nothing reaped our entry
                    // in the meantime, fail over as a timeout would.
                    drop(socket);
                    sleep_until(deadline).await;
                    self.table.remove(&entry.fingerprint);
                    return Ok(Attempt::Failed);
                }
            }
        }
    }

    /// Match an upstream datagram against the pending table. A match has
    /// the client's transaction ID restored and is sent to the origin
    /// endpoint on the main socket; the cached copy is written afterwards
    /// so the backend can never delay the reply. Orphans are dropped
    /// without emitting anything. A send fault toward the client is logged
    /// and swallowed here; it belongs to the delivered request, not to
    /// whichever attempt happened to receive the datagram.
    pub async fn dispatch_reply(&self, reply: &mut Vec<u8>) -> Option<PendingRequest> {
        let Some(reply_id) = protocol::read_id(reply) else {
            warn!(len = reply.len(), "runt upstream datagram, dropping");
            return None;
        };

        let Some(entry) = self.table.take_by_upstream_id(reply_id) else {
            warn!(reply_id, "orphan upstream reply, dropping");
            return None;
        };

        protocol::write_id(reply, entry.client_query_id);
        match self.socket.send_to(reply, entry.client_addr).await {
            Ok(_) => debug!(
                domain = %entry.domain,
                client = %entry.client_addr,
                fingerprint = %entry.fingerprint,
                "reply dispatched"
            ),
            Err(err) => warn!(
                client = %entry.client_addr,
                %err,
                "failed to send reply to client"
            ),
        }

        let cache = Arc::clone(&self.cache);
        let domain = entry.domain.clone();
        let response = reply.clone();
        tokio::spawn(async move {
            cache.put(&domain, &response, CACHE_TTL).await;
        });

        Some(entry)
    }
}

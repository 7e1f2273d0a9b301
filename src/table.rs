use crate::protocol::ID;
use parking_lot::RwLock;
use rand::prelude::*;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;

/// One in-flight upstream exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    /// Origin endpoint the reply must be sent back to.
    pub client_addr: SocketAddr,
    /// The identifier the client chose; restored into the outgoing reply.
    pub client_query_id: ID,
    /// The identifier substituted before forwarding; unique across the
    /// whole pending set.
    pub upstream_query_id: ID,
    /// Lower-cased QNAME, for logging and cache keying.
    pub domain: String,
    /// Stable internal handle, see [`crate::protocol::fingerprint`].
    pub fingerprint: String,
    pub created_at: Instant,
}

#[derive(Debug, PartialEq, Eq)]
pub enum InsertError {
    DuplicateFingerprint,
    DuplicateUpstreamId,
}

impl fmt::Display for InsertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InsertError::DuplicateFingerprint => write!(f, "fingerprint already pending"),
            InsertError::DuplicateUpstreamId => write!(f, "upstream query id already pending"),
        }
    }
}

impl Error for InsertError {}

/// Bimap of in-flight upstream exchanges: fingerprint to full request
/// metadata, and allocated upstream transaction ID back to fingerprint.
/// Mutations are serialized under one lock and keep both maps in step,
/// so at every observation point each entry is reachable both ways and
/// upstream IDs are pairwise distinct.
pub struct RequestTable {
    inner: RwLock<Maps>,
}

struct Maps {
    by_fingerprint: HashMap<String, PendingRequest>,
    by_upstream_id: HashMap<ID, String>,
}

impl RequestTable {
    pub fn new() -> RequestTable {
        RequestTable {
            inner: RwLock::new(Maps {
                by_fingerprint: HashMap::new(),
                by_upstream_id: HashMap::new(),
            }),
        }
    }

    /// Pick a uniformly random 16-bit identifier not currently pending.
    /// Loops with fresh randomness until unique; with N pending entries the
    /// expected number of retries is N/65536. Does not reserve the value --
    /// [`insert`](Self::insert) rejects the losing side if two allocations
    /// race to the same ID.
    pub fn alloc_id(&self) -> ID {
        self.alloc_id_with(&mut rand::thread_rng())
    }

    pub fn alloc_id_with<R: Rng>(&self, rng: &mut R) -> ID {
        let maps = self.inner.read();
        loop {
            let id: ID = rng.gen();
            if !maps.by_upstream_id.contains_key(&id) {
                return id;
            }
        }
    }

    /// Insert into both maps atomically. The table never exposes a
    /// partially constructed entry.
    pub fn insert(&self, request: PendingRequest) -> Result<(), InsertError> {
        let mut maps = self.inner.write();
        if maps.by_fingerprint.contains_key(&request.fingerprint) {
            return Err(InsertError::DuplicateFingerprint);
        }
        if maps.by_upstream_id.contains_key(&request.upstream_query_id) {
            return Err(InsertError::DuplicateUpstreamId);
        }
        maps.by_upstream_id
            .insert(request.upstream_query_id, request.fingerprint.clone());
        maps.by_fingerprint
            .insert(request.fingerprint.clone(), request);
        Ok(())
    }

    pub fn lookup_by_upstream_id(&self, id: ID) -> Option<PendingRequest> {
        let maps = self.inner.read();
        let fingerprint = maps.by_upstream_id.get(&id)?;
        maps.by_fingerprint.get(fingerprint).cloned()
    }

    pub fn lookup_by_fingerprint(&self, fingerprint: &str) -> Option<PendingRequest> {
        self.inner.read().by_fingerprint.get(fingerprint).cloned()
    }

    /// Atomically look up and remove by upstream ID; the single step the
    /// reply path needs so no concurrent dispatch can deliver twice.
    pub fn take_by_upstream_id(&self, id: ID) -> Option<PendingRequest> {
        let mut maps = self.inner.write();
        let fingerprint = maps.by_upstream_id.remove(&id)?;
        maps.by_fingerprint.remove(&fingerprint)
    }

    /// Remove from both maps. Idempotent.
    pub fn remove(&self, fingerprint: &str) -> Option<PendingRequest> {
        let mut maps = self.inner.write();
        let request = maps.by_fingerprint.remove(fingerprint)?;
        maps.by_upstream_id.remove(&request.upstream_query_id);
        Some(request)
    }

    /// Reap every entry older than `max_age`; returns the count swept.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut maps = self.inner.write();

        let stale: Vec<String> = maps
            .by_fingerprint
            .values()
            .filter(|request| now.saturating_duration_since(request.created_at) > max_age)
            .map(|request| request.fingerprint.clone())
            .collect();

        for fingerprint in &stale {
            if let Some(request) = maps.by_fingerprint.remove(fingerprint) {
                maps.by_upstream_id.remove(&request.upstream_query_id);
            }
        }

        stale.len()
    }

    /// (pending entries, allocated upstream IDs); always equal.
    pub fn stats(&self) -> (usize, usize) {
        let maps = self.inner.read();
        (maps.by_fingerprint.len(), maps.by_upstream_id.len())
    }
}

impl Default for RequestTable {
    fn default() -> Self {
        Self::new()
    }
}

//! In-memory TLS certificate cache with single-flight fetching.
//!
//! Each host has a slot holding its current certificate and, while one is
//! running, the shared handle of its fetch. The first caller that finds no
//! usable certificate starts the fetch; every other caller for that host
//! awaits the same handle. The fetch itself runs in its own task, so a
//! caller that gives up waiting does not cancel it.
//!
//! Map shard locks are only held for slot bookkeeping, never across a fetch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};

use super::{require_non_empty, Clock, IdentityError};
use crate::config::CertCacheConfig;
use crate::models::{CachedCertificate, FetchedCertificate};

/// Network collaborator that obtains a certificate for a host.
#[async_trait]
pub trait CertificateFetcher: Send + Sync {
    async fn fetch(&self, host_key: &str) -> anyhow::Result<FetchedCertificate>;
}

type SharedFetch = Shared<BoxFuture<'static, Result<CachedCertificate, String>>>;

struct InFlight {
    id: u64,
    fetch: SharedFetch,
}

#[derive(Default)]
struct Slot {
    entry: Option<CachedCertificate>,
    in_flight: Option<InFlight>,
    /// Logical access time for LRU ordering.
    last_access: AtomicU64,
}

impl Slot {
    fn fresh_entry(&self, now: DateTime<Utc>, margin: Duration) -> Option<&CachedCertificate> {
        self.entry
            .as_ref()
            .filter(|entry| !entry.needs_renewal_at(now, margin))
    }
}

struct Inner {
    fetcher: Arc<dyn CertificateFetcher>,
    clock: Arc<dyn Clock>,
    slots: DashMap<String, Slot>,
    max_entries: usize,
    renewal_margin: Duration,
    fetch_timeout: std::time::Duration,
    next_fetch_id: AtomicU64,
    access_tick: AtomicU64,
}

/// Cheap to clone; clones share slots.
#[derive(Clone)]
pub struct CertCache {
    inner: Arc<Inner>,
}

impl CertCache {
    pub fn new(
        fetcher: Arc<dyn CertificateFetcher>,
        clock: Arc<dyn Clock>,
        config: &CertCacheConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                fetcher,
                clock,
                slots: DashMap::new(),
                max_entries: config.max_entries.max(1),
                renewal_margin: config.renewal_margin(),
                fetch_timeout: config.fetch_timeout(),
                next_fetch_id: AtomicU64::new(1),
                access_tick: AtomicU64::new(0),
            }),
        }
    }

    /// Certificate bytes for `host_key`.
    ///
    /// Served from the cache unless missing, expired or within the renewal
    /// margin, in which case the caller joins (or starts) the host's fetch.
    /// A failed fetch still yields the previous certificate while it is
    /// unexpired; otherwise every waiter gets `FetchFailed`.
    #[tracing::instrument(skip_all, fields(host_key = %host_key))]
    pub async fn get(&self, host_key: &str) -> Result<Bytes, IdentityError> {
        require_non_empty("host_key", host_key)?;
        let now = self.inner.clock.now();

        if let Some(slot) = self.inner.slots.get(host_key) {
            if let Some(entry) = slot.fresh_entry(now, self.inner.renewal_margin) {
                slot.last_access.store(self.inner.tick(), Ordering::Relaxed);
                return Ok(entry.certificate_bytes.clone());
            }
        }

        let fetch = self.inner.join_or_start(host_key, now);
        fetch
            .await
            .map(|cert| cert.certificate_bytes)
            .map_err(|reason| IdentityError::FetchFailed {
                host_key: host_key.to_string(),
                reason,
            })
    }

    /// Drop the host's certificate; the next `get` fetches afresh. A fetch
    /// already running still answers its waiters but is not installed.
    pub fn invalidate(&self, host_key: &str) {
        if self.inner.slots.remove(host_key).is_some() {
            tracing::info!(host_key = %host_key, "Certificate invalidated");
        }
    }

    /// Install a certificate obtained out of band.
    pub fn insert(&self, host_key: &str, certificate: FetchedCertificate) -> Result<(), IdentityError> {
        require_non_empty("host_key", host_key)?;
        let now = self.inner.clock.now();
        if certificate.not_after <= now {
            return Err(IdentityError::Validation(format!(
                "certificate for {} is already expired",
                host_key
            )));
        }

        {
            let mut slot = self.inner.slots.entry(host_key.to_string()).or_default();
            slot.entry = Some(CachedCertificate::new(host_key.to_string(), certificate, now));
            slot.last_access.store(self.inner.tick(), Ordering::Relaxed);
        }
        self.inner.evict_over_capacity(host_key);
        Ok(())
    }

    /// Drop every certificate past `not_after`. Returns how many went.
    pub fn purge_expired(&self) -> usize {
        let now = self.inner.clock.now();
        let mut purged = 0;
        self.inner.slots.retain(|_, slot| {
            if slot.entry.as_ref().is_some_and(|e| e.is_expired_at(now)) {
                slot.entry = None;
                purged += 1;
            }
            slot.entry.is_some() || slot.in_flight.is_some()
        });
        if purged > 0 {
            tracing::debug!(purged, "Purged expired certificates");
        }
        purged
    }

    /// Hosts with a cached certificate.
    pub fn len(&self) -> usize {
        self.inner
            .slots
            .iter()
            .filter(|slot| slot.entry.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Inner {
    fn tick(&self) -> u64 {
        self.access_tick.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn join_or_start(self: &Arc<Self>, host_key: &str, now: DateTime<Utc>) -> SharedFetch {
        let mut slot = self.slots.entry(host_key.to_string()).or_default();
        slot.last_access.store(self.tick(), Ordering::Relaxed);

        // Installed while we waited for the shard.
        if let Some(entry) = slot.fresh_entry(now, self.renewal_margin) {
            let entry = entry.clone();
            return futures::future::ready(Ok(entry)).boxed().shared();
        }

        if let Some(in_flight) = &slot.in_flight {
            tracing::debug!(host_key = %host_key, "Joining in-flight certificate fetch");
            return in_flight.fetch.clone();
        }

        let id = self.next_fetch_id.fetch_add(1, Ordering::Relaxed);
        let fetch = self.start_fetch(host_key.to_string(), id);
        slot.in_flight = Some(InFlight {
            id,
            fetch: fetch.clone(),
        });
        fetch
    }

    fn start_fetch(self: &Arc<Self>, host_key: String, id: u64) -> SharedFetch {
        tracing::info!(host_key = %host_key, "Fetching certificate");
        let inner = Arc::clone(self);

        let task = tokio::spawn(async move {
            let outcome =
                match tokio::time::timeout(inner.fetch_timeout, inner.fetcher.fetch(&host_key)).await {
                    Ok(Ok(fetched)) => Ok(fetched),
                    Ok(Err(e)) => Err(format!("{:#}", e)),
                    Err(_) => Err(format!("timed out after {:?}", inner.fetch_timeout)),
                };
            inner.complete_fetch(&host_key, id, outcome)
        });

        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(format!("fetch task failed: {}", e)),
            }
        }
        .boxed()
        .shared()
    }

    /// Settle fetch `id` for `host_key` and decide what its waiters get.
    fn complete_fetch(
        &self,
        host_key: &str,
        id: u64,
        outcome: Result<FetchedCertificate, String>,
    ) -> Result<CachedCertificate, String> {
        let now = self.clock.now();
        let fetched = outcome.and_then(|fetched| {
            if fetched.not_after <= now {
                Err("fetched certificate is already expired".to_string())
            } else {
                Ok(CachedCertificate::new(host_key.to_string(), fetched, now))
            }
        });

        let result = match self.slots.get_mut(host_key) {
            Some(mut slot) if slot.in_flight.as_ref().is_some_and(|f| f.id == id) => {
                slot.in_flight = None;
                match fetched {
                    Ok(cert) => {
                        tracing::info!(host_key = %host_key, not_after = %cert.not_after, "Certificate installed");
                        if cert.needs_renewal_at(now, self.renewal_margin) {
                            tracing::warn!(
                                host_key = %host_key,
                                not_after = %cert.not_after,
                                renewal_margin_seconds = self.renewal_margin.num_seconds(),
                                "Certificate lifetime is inside the renewal margin; every get will refetch"
                            );
                        }
                        slot.entry = Some(cert.clone());
                        Ok(cert)
                    }
                    Err(reason) => {
                        let stale = slot
                            .entry
                            .as_ref()
                            .filter(|entry| !entry.is_expired_at(now))
                            .cloned();
                        match stale {
                            Some(stale) => {
                                tracing::warn!(
                                    host_key = %host_key,
                                    error = %reason,
                                    not_after = %stale.not_after,
                                    "Certificate fetch failed; serving cached certificate"
                                );
                                Ok(stale)
                            }
                            None => {
                                tracing::warn!(host_key = %host_key, error = %reason, "Certificate fetch failed");
                                slot.entry = None;
                                Err(reason)
                            }
                        }
                    }
                }
            }
            // Invalidated (or replaced) while the fetch ran.
            _ => fetched,
        };

        self.slots
            .remove_if(host_key, |_, slot| slot.entry.is_none() && slot.in_flight.is_none());
        self.evict_over_capacity(host_key);
        result
    }

    /// Evict least-recently-used hosts until within `max_entries`. Hosts
    /// with a fetch in flight and `keep` are never chosen.
    fn evict_over_capacity(&self, keep: &str) {
        let mut attempts = self.slots.len();
        while self.slots.len() > self.max_entries && attempts > 0 {
            attempts -= 1;

            let victim = self
                .slots
                .iter()
                .filter(|slot| slot.key() != keep && slot.in_flight.is_none())
                .min_by_key(|slot| slot.last_access.load(Ordering::Relaxed))
                .map(|slot| slot.key().clone());
            let Some(victim) = victim else {
                break;
            };

            if self
                .slots
                .remove_if(&victim, |_, slot| slot.in_flight.is_none())
                .is_some()
            {
                tracing::debug!(host_key = %victim, "Evicted least recently used certificate");
            }
        }
    }
}

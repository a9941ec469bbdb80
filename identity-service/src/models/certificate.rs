use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};

/// What a [`CertificateFetcher`](crate::services::CertificateFetcher) returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedCertificate {
    pub certificate_bytes: Bytes,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

/// Certificate held by the cache. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedCertificate {
    pub host_key: String,
    pub certificate_bytes: Bytes,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
}

impl CachedCertificate {
    pub fn new(host_key: String, fetched: FetchedCertificate, now: DateTime<Utc>) -> Self {
        Self {
            host_key,
            certificate_bytes: fetched.certificate_bytes,
            not_before: fetched.not_before,
            not_after: fetched.not_after,
            fetched_at: now,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.not_after
    }

    /// True once `now` is within `margin` of `not_after` (or past it).
    pub fn needs_renewal_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        self.not_after - now <= margin
    }
}

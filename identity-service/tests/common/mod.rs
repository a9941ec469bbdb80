//! Test helper module for identity-service integration tests.
//!
//! Every test gets its own in-memory gateway, a manually driven clock and a
//! scripted certificate fetcher, wired together through `IdentityRegistry`.

#![allow(dead_code)]

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use identity_service::{
    config::IdentityConfig,
    models::{Actor, FetchedCertificate, OrgRole},
    services::{CertificateFetcher, Clock, MockClock},
    IdentityRegistry,
};
use service_core::persistence::MemoryGateway;

pub fn start_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

pub fn scopes(list: &[&str]) -> BTreeSet<String> {
    list.iter().map(|s| s.to_string()).collect()
}

pub fn certificate(body: &str, not_after: DateTime<Utc>) -> FetchedCertificate {
    FetchedCertificate {
        certificate_bytes: Bytes::from(body.to_string()),
        not_before: not_after - Duration::days(90),
        not_after,
    }
}

/// Fetcher that replays queued outcomes and counts calls. With nothing
/// queued it issues a 90-day certificate whose body is the host key.
pub struct ScriptedFetcher {
    clock: MockClock,
    calls: AtomicUsize,
    delay: Mutex<Option<StdDuration>>,
    script: Mutex<VecDeque<Result<FetchedCertificate, String>>>,
}

impl ScriptedFetcher {
    pub fn new(clock: MockClock) -> Self {
        Self {
            clock,
            calls: AtomicUsize::new(0),
            delay: Mutex::new(None),
            script: Mutex::new(VecDeque::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_delay(&self, delay: StdDuration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn push_ok(&self, cert: FetchedCertificate) {
        self.script.lock().unwrap().push_back(Ok(cert));
    }

    pub fn push_err(&self, reason: &str) {
        self.script.lock().unwrap().push_back(Err(reason.to_string()));
    }
}

#[async_trait]
impl CertificateFetcher for ScriptedFetcher {
    async fn fetch(&self, host_key: &str) -> anyhow::Result<FetchedCertificate> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(cert)) => Ok(cert),
            Some(Err(reason)) => Err(anyhow::anyhow!(reason)),
            None => Ok(certificate(host_key, self.clock.now() + Duration::days(90))),
        }
    }
}

/// Test application: a registry over isolated in-memory state.
pub struct TestApp {
    pub registry: IdentityRegistry,
    pub gateway: MemoryGateway,
    pub clock: MockClock,
    pub fetcher: Arc<ScriptedFetcher>,
}

impl TestApp {
    pub fn spawn() -> Self {
        Self::spawn_with_config(IdentityConfig::default())
    }

    pub fn spawn_with_config(config: IdentityConfig) -> Self {
        let gateway = MemoryGateway::new();
        let clock = MockClock::new(start_time());
        let fetcher = Arc::new(ScriptedFetcher::new(clock.clone()));

        let registry = IdentityRegistry::builder(config, Arc::new(gateway.clone()), fetcher.clone())
            .clock(Arc::new(clock.clone()))
            .build()
            .expect("Failed to build registry");

        Self {
            registry,
            gateway,
            clock,
            fetcher,
        }
    }

    /// Seed `user_id` into `org_id` with `role`.
    pub async fn seed_member(&self, org_id: &str, user_id: &str, role: OrgRole) {
        self.registry
            .org_members
            .add(&Actor::System, org_id, user_id, role)
            .await
            .expect("Failed to seed membership");
    }
}

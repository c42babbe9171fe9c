//! JWKS cache, one slot per issuer
//!
//! Readers never wait on a refresh of a stale-but-present key set: the
//! refresher is elected with `try_lock` and everyone else keeps reading the
//! old set until the new one is swapped in. A cold slot is fetched once, with
//! concurrent callers queued behind the same fetch.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use jsonwebtoken::jwk::JwkSet;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::VerificationError;

#[derive(Clone)]
struct CachedJwks {
    keys: Arc<JwkSet>,
    fetched_at: Instant,
}

#[derive(Default)]
struct JwksSlot {
    current: RwLock<Option<CachedJwks>>,
    refresh: tokio::sync::Mutex<()>,
    last_forced: parking_lot::Mutex<Option<Instant>>,
}

impl JwksSlot {
    fn snapshot(&self) -> Option<CachedJwks> {
        self.current.read().clone()
    }

    fn store(&self, keys: JwkSet) -> Arc<JwkSet> {
        let keys = Arc::new(keys);
        *self.current.write() = Some(CachedJwks {
            keys: Arc::clone(&keys),
            fetched_at: Instant::now(),
        });
        keys
    }
}

/// Process-wide JWKS cache keyed by issuer
pub struct JwksCache {
    slots: DashMap<String, Arc<JwksSlot>>,
    http: reqwest::Client,
    ttl: Duration,
    min_refresh_interval: Duration,
}

impl JwksCache {
    /// Create a cache
    #[must_use]
    pub fn new(http: reqwest::Client, ttl: Duration, min_refresh_interval: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            http,
            ttl,
            min_refresh_interval,
        }
    }

    fn slot(&self, issuer: &str) -> Arc<JwksSlot> {
        Arc::clone(self.slots.entry(issuer.to_string()).or_default().value())
    }

    /// Key set for `issuer`, fetching from `jwks_uri` when missing or stale.
    ///
    /// # Errors
    ///
    /// [`VerificationError::KeySource`] only when the fetch fails and nothing
    /// is cached.
    pub async fn get(
        &self,
        issuer: &str,
        jwks_uri: &str,
    ) -> Result<Arc<JwkSet>, VerificationError> {
        let slot = self.slot(issuer);

        match slot.snapshot() {
            Some(cached) if cached.fetched_at.elapsed() < self.ttl => Ok(cached.keys),
            Some(stale) => {
                // Someone else is refreshing; keep serving the old set
                let Ok(_guard) = slot.refresh.try_lock() else {
                    return Ok(stale.keys);
                };
                match self.fetch(jwks_uri).await {
                    Ok(keys) => Ok(slot.store(keys)),
                    Err(e) => {
                        warn!(
                            issuer = %issuer,
                            error = %e,
                            "JWKS refresh failed, using stale keys"
                        );
                        Ok(stale.keys)
                    }
                }
            }
            None => {
                let _guard = slot.refresh.lock().await;
                if let Some(cached) = slot.snapshot() {
                    return Ok(cached.keys);
                }
                let keys = self.fetch(jwks_uri).await?;
                Ok(slot.store(keys))
            }
        }
    }

    /// Refetch after a `kid` miss.
    ///
    /// Returns `Ok(None)` when a forced refresh happened too recently. A
    /// refresh completed by another caller while waiting is reused.
    pub async fn force_refresh(
        &self,
        issuer: &str,
        jwks_uri: &str,
    ) -> Result<Option<Arc<JwkSet>>, VerificationError> {
        let slot = self.slot(issuer);
        let requested_at = Instant::now();

        {
            let mut last = slot.last_forced.lock();
            if last.is_some_and(|t| t.elapsed() < self.min_refresh_interval) {
                debug!(issuer = %issuer, "Forced JWKS refresh rate-limited");
                return Ok(None);
            }
            *last = Some(requested_at);
        }

        let _guard = slot.refresh.lock().await;
        if let Some(cached) = slot.snapshot() {
            if cached.fetched_at >= requested_at {
                return Ok(Some(cached.keys));
            }
        }

        info!(issuer = %issuer, "Refreshing JWKS after unknown key id");
        let keys = self.fetch(jwks_uri).await?;
        Ok(Some(slot.store(keys)))
    }

    /// Drop the cached set for `issuer`
    pub fn invalidate(&self, issuer: &str) {
        self.slots.remove(issuer);
    }

    async fn fetch(&self, jwks_uri: &str) -> Result<JwkSet, VerificationError> {
        if !jwks_uri.starts_with("https://") {
            warn!(uri = %jwks_uri, "JWKS endpoint is not HTTPS");
        }
        debug!(uri = %jwks_uri, "Fetching JWKS");

        let keys: JwkSet = self
            .http
            .get(jwks_uri)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| VerificationError::KeySource(e.to_string()))?
            .json()
            .await
            .map_err(|e| VerificationError::KeySource(format!("invalid JWKS document: {e}")))?;

        debug!(keys = keys.keys.len(), "JWKS fetched");
        Ok(keys)
    }
}

//! Typed policy lookups over a [`PolicyStore`].

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use warden_core::flex::is_flex_domain;
use warden_core::{ClientPolicy, DecisionRecord, SecurityLevel};

use crate::error::Result;
use crate::keys;
use crate::store::PolicyStore;

/// Reads and writes the per-client policy the proxy decides with.
#[derive(Clone)]
pub struct PolicyView {
    store: Arc<dyn PolicyStore>,
    default_level: SecurityLevel,
}

impl PolicyView {
    /// Creates a view; `default_level` applies to clients without a stored level.
    pub fn new(store: Arc<dyn PolicyStore>, default_level: SecurityLevel) -> Self {
        Self {
            store,
            default_level,
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn PolicyStore> {
        &self.store
    }

    pub fn default_level(&self) -> SecurityLevel {
        self.default_level
    }

    /// Security level of a client; missing or unparseable values use the default.
    pub fn security_level(&self, client: &str) -> SecurityLevel {
        match self.store.get(&keys::security_level(client)) {
            Some(raw) => SecurityLevel::parse(&raw).unwrap_or_else(|| {
                warn!(
                    "Unparseable security level {:?} for {}, using {}",
                    raw, client, self.default_level
                );
                self.default_level
            }),
            None => self.default_level,
        }
    }

    pub fn set_security_level(&self, client: &str, level: SecurityLevel) {
        self.store
            .set(&keys::security_level(client), level.as_str(), None);
    }

    /// True if any of `fqdns` is flagged as pinned for the client.
    ///
    /// Entries of the form `*.example.com` pin every name under the suffix.
    pub fn any_pinned(&self, client: &str, fqdns: &[String]) -> bool {
        let pinned = self.store.members(&keys::pinned(client));
        if pinned.is_empty() {
            return false;
        }
        fqdns.iter().any(|fqdn| {
            let fqdn = fqdn.to_lowercase();
            pinned.iter().any(|entry| match entry.strip_prefix('*') {
                Some(suffix) => suffix.starts_with('.') && fqdn.ends_with(suffix),
                None => *entry == fqdn,
            })
        })
    }

    pub fn set_pinned(&self, client: &str, fqdn: &str) {
        self.store.add_member(&keys::pinned(client), &fqdn.to_lowercase());
    }

    /// Fqdns the client resolved to `server`, sorted.
    pub fn dns_fqdns(&self, client: &str, server: &str) -> Vec<String> {
        let mut fqdns = self.store.members(&keys::dns(server, client));
        fqdns.sort();
        fqdns
    }

    /// Records that the client resolved `fqdn` to `server`.
    pub fn record_dns(&self, server: &str, client: &str, fqdn: &str) {
        self.store
            .add_member(&keys::dns(server, client), &fqdn.to_lowercase());
    }

    /// Flex membership for a client; exclusion wins.
    pub fn is_flex_domain(&self, client: &str, fqdn: &str) -> bool {
        let include = keys::flex_include(client);
        let exclude = keys::flex_exclude(client);
        is_flex_domain(
            fqdn,
            |d| self.store.is_member(&include, d),
            |d| self.store.is_member(&exclude, d),
        )
    }

    pub fn add_flex_include(&self, client: &str, domain: &str) {
        self.store
            .add_member(&keys::flex_include(client), &domain.to_lowercase());
    }

    pub fn add_flex_exclude(&self, client: &str, domain: &str) {
        self.store
            .add_member(&keys::flex_exclude(client), &domain.to_lowercase());
    }

    pub fn show_block_stats(&self, client: &str) -> bool {
        self.store
            .get(&keys::show_block_stats(client))
            .is_some_and(|v| matches!(v.trim(), "true" | "1"))
    }

    pub fn set_show_block_stats(&self, client: &str, enabled: bool) {
        let key = keys::show_block_stats(client);
        if enabled {
            self.store.set(&key, "true", None);
        } else {
            self.store.delete(&key);
        }
    }

    /// Cached decision for a pair. A corrupt entry reads as a miss.
    pub fn cached_decision(&self, client: &str, target: &str) -> Option<DecisionRecord> {
        let raw = self.store.get(&keys::conn(client, target))?;
        match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Discarding corrupt decision for {} -> {}: {}", client, target, e);
                None
            }
        }
    }

    /// Re-arms the TTL of a cached decision.
    pub fn touch_decision(&self, client: &str, target: &str, ttl: Duration) -> bool {
        let touched = self.store.touch(&keys::conn(client, target), ttl);
        if touched {
            self.store.touch(&keys::passthru(client, target), ttl);
        }
        touched
    }

    /// Caches a decision with `ttl`.
    ///
    /// Written as set-if-absent then set-if-present, both with the TTL, so the
    /// key ends up holding this record and a fresh expiry either way.
    pub fn store_decision(&self, record: &DecisionRecord, ttl: Duration) -> Result<()> {
        let key = keys::conn(&record.client, &record.target);
        let value = serde_json::to_string(record)?;
        if !self.store.set_if_absent(&key, &value, Some(ttl)) {
            self.store.set_if_present(&key, &value, Some(ttl));
        }

        let passthru_key = keys::passthru(&record.client, &record.target);
        if record.passthru() {
            self.store.set(&passthru_key, "true", Some(ttl));
        } else {
            self.store.delete(&passthru_key);
        }
        debug!(
            "Cached {} for {} -> {} ({})",
            record.decision, record.client, record.target, record.reason
        );
        Ok(())
    }

    /// True if a pair was last relayed without interception.
    pub fn is_passthru(&self, client: &str, target: &str) -> bool {
        self.store.get(&keys::passthru(client, target)).is_some()
    }

    pub fn has_filter_bypass(&self, method: &str, user_agent: &str, url: &str) -> bool {
        self.store
            .get(&keys::filter_bypass(method, user_agent, url))
            .is_some()
    }

    /// Re-arms a filter bypass. Returns false if none was cached.
    pub fn refresh_filter_bypass(&self, method: &str, user_agent: &str, url: &str, ttl: Duration) -> bool {
        self.store
            .touch(&keys::filter_bypass(method, user_agent, url), ttl)
    }

    pub fn set_filter_bypass(&self, method: &str, user_agent: &str, url: &str, ttl: Duration) {
        self.store
            .set(&keys::filter_bypass(method, user_agent, url), "true", Some(ttl));
    }

    /// Writes a statically configured client policy into the store.
    pub fn seed_client(&self, policy: &ClientPolicy) {
        let client = policy.addr.trim();
        if let Some(level) = policy.security_level {
            self.set_security_level(client, level);
        }
        for fqdn in &policy.pinned {
            self.set_pinned(client, fqdn);
        }
        for domain in &policy.flex_include {
            self.add_flex_include(client, domain);
        }
        for domain in &policy.flex_exclude {
            self.add_flex_exclude(client, domain);
        }
        if policy.show_block_stats {
            self.set_show_block_stats(client, true);
        }
        debug!("Seeded policy for client {}", client);
    }
}

impl std::fmt::Debug for PolicyView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyView")
            .field("default_level", &self.default_level)
            .finish()
    }
}

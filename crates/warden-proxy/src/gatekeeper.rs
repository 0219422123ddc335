//! Connection gatekeeper.
//!
//! Decides, once per client connection, whether the proxy relays the bytes
//! untouched, refuses the connection, or terminates TLS to inspect it.
//! Decisions are cached per (client, target) pair and downgraded when the
//! client rejects the proxy's certificate.

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use warden_core::config::WardenConfig;
use warden_core::{
    ActivityEvent, ActivityLog, CheckVerdict, ConnDecision, DecisionRecord, Reason, SecurityLevel,
    Stage,
};
use warden_storage::PolicyView;

use crate::api::{ConnCheckRequest, PolicyApi};

/// Activity action for blocks turned into intercepts by show-block-stats.
pub const FLAGGED_ACTION: &str = "flagged";

/// Security level in effect for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientLevel {
    pub level: SecurityLevel,
    /// True if one of the connection's fqdns is pinned for the client.
    pub pinned: bool,
}

impl ClientLevel {
    pub fn new(level: SecurityLevel) -> Self {
        Self {
            level,
            pinned: false,
        }
    }

    pub fn pinned(level: SecurityLevel) -> Self {
        Self {
            level,
            pinned: true,
        }
    }
}

/// Cache key target for a connection: the only fqdn, or the server address.
pub fn cache_target<'a>(server: &'a str, fqdns: &'a [String]) -> &'a str {
    match fqdns {
        [only] => only,
        _ => server,
    }
}

// =============================================================================
// Connection state machine
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Undecided,
    Passthru,
    Intercepting,
    Blocked,
}

impl From<ConnDecision> for GateState {
    fn from(decision: ConnDecision) -> Self {
        match decision {
            ConnDecision::Passthru => GateState::Passthru,
            ConnDecision::Block => GateState::Blocked,
            ConnDecision::Intercept => GateState::Intercepting,
        }
    }
}

/// One client connection as seen by the gatekeeper.
///
/// Leaves `Undecided` exactly once.
#[derive(Debug, Clone)]
pub struct ConnectionGate {
    pub client: String,
    pub server: String,
    pub fqdns: Vec<String>,
    pub level: ClientLevel,
    state: GateState,
    record: Option<DecisionRecord>,
}

impl ConnectionGate {
    pub fn new(
        client: impl Into<String>,
        server: impl Into<String>,
        fqdns: Vec<String>,
        level: ClientLevel,
    ) -> Self {
        Self {
            client: client.into(),
            server: server.into(),
            fqdns,
            level,
            state: GateState::Undecided,
            record: None,
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    /// The decision the gate entered with.
    pub fn record(&self) -> Option<&DecisionRecord> {
        self.record.as_ref()
    }

    /// Applies a decision. Returns false if the gate was already decided.
    pub fn enter(&mut self, record: DecisionRecord) -> bool {
        if self.state != GateState::Undecided {
            return false;
        }
        self.state = record.decision.into();
        self.record = Some(record);
        true
    }

    /// Host name the client asked for, if any.
    pub fn sni(&self) -> Option<&str> {
        self.fqdns.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Established,
    Failed,
}

/// One-shot report of how the client TLS handshake ended.
///
/// Dropping the reporter without reporting leaves the cache untouched.
#[derive(Debug)]
pub struct HandshakeReporter {
    tx: oneshot::Sender<HandshakeOutcome>,
}

impl HandshakeReporter {
    pub fn established(self) {
        let _ = self.tx.send(HandshakeOutcome::Established);
    }

    pub fn failed(self) {
        let _ = self.tx.send(HandshakeOutcome::Failed);
    }
}

// =============================================================================
// Gatekeeper
// =============================================================================

#[derive(Clone)]
pub struct Gatekeeper {
    config: Arc<WardenConfig>,
    policy: PolicyView,
    api: Arc<dyn PolicyApi>,
    activity: Arc<dyn ActivityLog>,
}

impl Gatekeeper {
    pub fn new(
        config: Arc<WardenConfig>,
        policy: PolicyView,
        api: Arc<dyn PolicyApi>,
        activity: Arc<dyn ActivityLog>,
    ) -> Self {
        Self {
            config,
            policy,
            api,
            activity,
        }
    }

    /// Security level for a connection, raised to maximum when a standard
    /// client reaches a pinned fqdn.
    pub fn client_level(&self, client: &str, fqdns: &[String]) -> ClientLevel {
        let level = self.policy.security_level(client);
        let pinned = level.supports_request_modification() && self.policy.any_pinned(client, fqdns);
        if pinned {
            ClientLevel::pinned(SecurityLevel::Maximum)
        } else {
            ClientLevel::new(level)
        }
    }

    /// Decides what happens to a new connection.
    pub async fn decide(
        &self,
        client: &str,
        server: &str,
        fqdns: &[String],
        level: ClientLevel,
    ) -> DecisionRecord {
        let target = cache_target(server, fqdns);
        let record = |decision, reason| {
            DecisionRecord::new(client, target, decision, reason).with_fqdns(fqdns)
        };

        let mut names = std::iter::once(server).chain(fqdns.iter().map(String::as_str));
        if names.any(|name| self.config.is_control_host(name)) {
            return self.finish(record(ConnDecision::Passthru, Reason::SelfHost));
        }

        let mut names = std::iter::once(server).chain(fqdns.iter().map(String::as_str));
        if names.any(|name| self.config.is_management_host(name)) {
            return self.finish(record(ConnDecision::Passthru, Reason::ManagementService));
        }

        if !self.config.local_network.contains_str(client) {
            return self.finish(record(ConnDecision::Block, Reason::ForeignClient));
        }

        if level.level.forces_passthru() {
            return self.finish(record(ConnDecision::Passthru, Reason::SecurityLevel));
        }

        if matches!(fqdns, [only] if self.config.is_cert_probe_host(only)) {
            return self.finish(record(ConnDecision::Intercept, Reason::CertProbe));
        }

        if fqdns.is_empty() {
            let decision = if level.level.is_maximum() {
                ConnDecision::Block
            } else {
                ConnDecision::Passthru
            };
            return self.finish(record(decision, Reason::NoFqdn));
        }

        let ttl = self.config.cache.decision_ttl();
        if let Some(cached) = self.policy.cached_decision(client, target) {
            self.policy.touch_decision(client, target, ttl);
            debug!("Cached {} for {} -> {}", cached.decision, client, target);
            self.record_activity(&cached, Reason::Cached);
            return cached;
        }

        let request = ConnCheckRequest {
            server_addr: server.to_string(),
            fqdns: fqdns.to_vec(),
            client_addr: client.to_string(),
        };
        let (decision, reason) = match self.api.check_connection(&request).await {
            Ok(CheckVerdict::Passthru) => (ConnDecision::Passthru, Reason::PolicyCheck),
            Ok(CheckVerdict::Block) => (ConnDecision::Block, Reason::PolicyCheck),
            Ok(CheckVerdict::Other(_)) => (ConnDecision::Intercept, Reason::PolicyCheck),
            Ok(CheckVerdict::Error) => (fail_decision(level), Reason::PolicyError),
            Err(e) => {
                warn!("Connection check for {} -> {} failed: {}", client, target, e);
                (fail_decision(level), Reason::PolicyError)
            }
        };

        let mut computed = record(decision, reason);
        if computed.block() && self.shows_block_stats(client, level) {
            computed.decision = ConnDecision::Intercept;
            computed.reason = Reason::ShowBlockStats;
        }

        if let Err(e) = self.policy.store_decision(&computed, ttl) {
            warn!("Failed to cache decision for {} -> {}: {}", client, target, e);
        }
        self.finish(computed)
    }

    /// Gathers the fqdns for a new connection, decides it and returns the
    /// decided gate.
    ///
    /// The SNI wins; without one, names the client resolved to `server` are
    /// read from the DNS capture.
    pub async fn on_next_layer(
        &self,
        client: &str,
        server: &str,
        sni: Option<&str>,
    ) -> ConnectionGate {
        let fqdns = match sni.map(str::trim).filter(|s| !s.is_empty()) {
            Some(sni) => vec![sni.to_lowercase()],
            None => self.policy.dns_fqdns(client, server),
        };

        let level = self.client_level(client, &fqdns);
        let record = self.decide(client, server, &fqdns, level).await;

        let mut gate = ConnectionGate::new(client, server, fqdns, level);
        gate.enter(record);
        gate
    }

    /// Returns a reporter for the client handshake of an intercepted
    /// connection. Failure downgrades the cached decision.
    pub fn watch_handshake(&self, gate: &ConnectionGate) -> Option<HandshakeReporter> {
        if gate.state() != GateState::Intercepting {
            return None;
        }

        let (tx, rx) = oneshot::channel();
        let gatekeeper = self.clone();
        let gate = gate.clone();
        tokio::spawn(async move {
            match rx.await {
                Ok(HandshakeOutcome::Failed) => {
                    gatekeeper.handshake_failed(&gate.client, &gate.server, &gate.fqdns, gate.level);
                }
                Ok(HandshakeOutcome::Established) => {
                    debug!("TLS established for {} -> {}", gate.client, gate.server);
                }
                Err(_) => {}
            }
        });

        Some(HandshakeReporter { tx })
    }

    /// Downgrades the cached decision after the client rejected the proxy's
    /// certificate. Writes one record per fqdn, or one for the server when
    /// there are none.
    pub fn handshake_failed(
        &self,
        client: &str,
        server: &str,
        fqdns: &[String],
        level: ClientLevel,
    ) -> ConnDecision {
        let (decision, reason) = match (level.level.is_maximum(), level.pinned) {
            (true, true) => (ConnDecision::Intercept, Reason::TlsFailurePinned),
            (true, false) => (ConnDecision::Block, Reason::TlsFailure),
            _ => (ConnDecision::Passthru, Reason::TlsFailure),
        };

        let targets: Vec<&str> = if fqdns.is_empty() {
            vec![server]
        } else {
            fqdns.iter().map(String::as_str).collect()
        };

        let ttl = self.config.cache.decision_ttl();
        for target in targets {
            let record = DecisionRecord::new(client, target, decision, reason).with_fqdns(fqdns);
            if let Err(e) = self.policy.store_decision(&record, ttl) {
                warn!("Failed to cache TLS downgrade for {} -> {}: {}", client, target, e);
            }
            self.record_activity(&record, reason);
        }

        info!(
            "TLS handshake failed for {} -> {}, now {} ({})",
            client, server, decision, reason
        );
        decision
    }

    fn shows_block_stats(&self, client: &str, level: ClientLevel) -> bool {
        level.level.supports_request_modification()
            && (self.config.show_block_stats || self.policy.show_block_stats(client))
    }

    fn finish(&self, record: DecisionRecord) -> DecisionRecord {
        debug!(
            "{} -> {}: {} ({})",
            record.client, record.target, record.decision, record.reason
        );
        self.record_activity(&record, record.reason);
        record
    }

    fn record_activity(&self, record: &DecisionRecord, reason: Reason) {
        let action = if record.reason == Reason::ShowBlockStats {
            FLAGGED_ACTION
        } else {
            record.decision.as_str()
        };
        self.activity.record(ActivityEvent::new(
            Stage::Connection,
            &record.client,
            &record.target,
            action,
            reason,
        ));
    }
}

/// Decision when the policy service cannot answer.
fn fail_decision(level: ClientLevel) -> ConnDecision {
    if level.level.is_maximum() {
        ConnDecision::Block
    } else {
        ConnDecision::Passthru
    }
}

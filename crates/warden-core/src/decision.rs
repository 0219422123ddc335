//! Decision types shared by the gatekeeper, the request router and the
//! filter pipeline, plus the wire shapes of the remote policy service.

use serde::{Deserialize, Serialize};

// =============================================================================
// Connection decisions
// =============================================================================

/// What to do with a client's TLS connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnDecision {
    /// Relay raw bytes, no TLS termination.
    Passthru,
    /// Refuse the connection.
    Block,
    /// Terminate TLS and inspect plaintext.
    Intercept,
}

impl ConnDecision {
    /// Returns the decision name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnDecision::Passthru => "passthru",
            ConnDecision::Block => "block",
            ConnDecision::Intercept => "intercept",
        }
    }
}

impl std::fmt::Display for ConnDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason code attached to every decision and activity record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    SelfHost,
    ManagementService,
    ForeignClient,
    SecurityLevel,
    CertProbe,
    NoFqdn,
    Cached,
    PolicyCheck,
    PolicyError,
    ShowBlockStats,
    TlsFailure,
    TlsFailurePinned,
    Health,
    NoHost,
    RedirectHttps,
    Tarpit,
    SpecialPath,
    MatchersError,
    PassThru,
    NoMatch,
    Abort,
    Matched,
    NoMatchers,
    FilterBypass,
    FilterApplied,
    FilterError,
    FilterStopped,
    FlexRouted,
    FlexTunnel,
    FlexFallback,
    FlexUnavailable,
}

impl Reason {
    /// Returns the reason code as written to the activity log.
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::SelfHost => "self_host",
            Reason::ManagementService => "management_service",
            Reason::ForeignClient => "foreign_client",
            Reason::SecurityLevel => "security_level",
            Reason::CertProbe => "cert_probe",
            Reason::NoFqdn => "no_fqdn",
            Reason::Cached => "cached",
            Reason::PolicyCheck => "policy_check",
            Reason::PolicyError => "policy_error",
            Reason::ShowBlockStats => "show_block_stats",
            Reason::TlsFailure => "tls_failure",
            Reason::TlsFailurePinned => "tls_failure_pinned",
            Reason::Health => "health",
            Reason::NoHost => "no_host",
            Reason::RedirectHttps => "redirect_https",
            Reason::Tarpit => "tarpit",
            Reason::SpecialPath => "special_path",
            Reason::MatchersError => "matchers_error",
            Reason::PassThru => "pass_thru",
            Reason::NoMatch => "no_match",
            Reason::Abort => "abort",
            Reason::Matched => "matched",
            Reason::NoMatchers => "no_matchers",
            Reason::FilterBypass => "filter_bypass",
            Reason::FilterApplied => "filter_applied",
            Reason::FilterError => "filter_error",
            Reason::FilterStopped => "filter_stopped",
            Reason::FlexRouted => "flex_routed",
            Reason::FlexTunnel => "flex_tunnel",
            Reason::FlexFallback => "flex_fallback",
            Reason::FlexUnavailable => "flex_unavailable",
        }
    }
}

impl Reason {
    /// Every reason code.
    pub const ALL: &'static [Reason] = &[
        Reason::SelfHost,
        Reason::ManagementService,
        Reason::ForeignClient,
        Reason::SecurityLevel,
        Reason::CertProbe,
        Reason::NoFqdn,
        Reason::Cached,
        Reason::PolicyCheck,
        Reason::PolicyError,
        Reason::ShowBlockStats,
        Reason::TlsFailure,
        Reason::TlsFailurePinned,
        Reason::Health,
        Reason::NoHost,
        Reason::RedirectHttps,
        Reason::Tarpit,
        Reason::SpecialPath,
        Reason::MatchersError,
        Reason::PassThru,
        Reason::NoMatch,
        Reason::Abort,
        Reason::Matched,
        Reason::NoMatchers,
        Reason::FilterBypass,
        Reason::FilterApplied,
        Reason::FilterError,
        Reason::FilterStopped,
        Reason::FlexRouted,
        Reason::FlexTunnel,
        Reason::FlexFallback,
        Reason::FlexUnavailable,
    ];

    /// Parses a reason code.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|r| r.as_str() == s)
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cached verdict for one (client, target) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRecord {
    /// Server address or fqdn the client connected to.
    pub target: String,
    /// Client address.
    pub client: String,
    /// The verdict.
    pub decision: ConnDecision,
    /// Why the verdict was reached.
    pub reason: Reason,
    /// Fqdns attributed to the target when the verdict was computed.
    #[serde(default)]
    pub fqdns: Vec<String>,
}

impl DecisionRecord {
    /// Creates a record.
    pub fn new(
        client: impl Into<String>,
        target: impl Into<String>,
        decision: ConnDecision,
        reason: Reason,
    ) -> Self {
        Self {
            target: target.into(),
            client: client.into(),
            decision,
            reason,
            fqdns: Vec::new(),
        }
    }

    /// Attaches the fqdns the verdict was computed for.
    pub fn with_fqdns(mut self, fqdns: &[String]) -> Self {
        self.fqdns = fqdns.to_vec();
        self
    }

    /// True if the connection should be relayed untouched.
    pub fn passthru(&self) -> bool {
        self.decision == ConnDecision::Passthru
    }

    /// True if the connection should be refused.
    pub fn block(&self) -> bool {
        self.decision == ConnDecision::Block
    }
}

/// Verdict returned by the remote connection check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckVerdict {
    Error,
    Passthru,
    Block,
    Other(String),
}

impl CheckVerdict {
    /// Maps the raw response value.
    pub fn parse(s: &str) -> Self {
        match s.trim().trim_matches('"') {
            "error" => CheckVerdict::Error,
            "passthru" => CheckVerdict::Passthru,
            "block" => CheckVerdict::Block,
            other => CheckVerdict::Other(other.to_string()),
        }
    }
}

// =============================================================================
// Request decisions
// =============================================================================

/// Coarse decision returned by the remote matcher service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FilterDecision {
    PassThru,
    AbortOk,
    AbortNotFound,
    NoMatch,
    Match,
    /// An `abort_*` value this proxy does not know.
    AbortOther(String),
    /// Anything else.
    Unknown(String),
}

impl FilterDecision {
    /// Returns the wire name.
    pub fn as_str(&self) -> &str {
        match self {
            FilterDecision::PassThru => "pass_thru",
            FilterDecision::AbortOk => "abort_ok",
            FilterDecision::AbortNotFound => "abort_not_found",
            FilterDecision::NoMatch => "no_match",
            FilterDecision::Match => "match",
            FilterDecision::AbortOther(s) | FilterDecision::Unknown(s) => s,
        }
    }

    /// Status code of the synthesized response, for abort decisions.
    pub fn abort_status(&self) -> Option<u16> {
        match self {
            FilterDecision::AbortOk => Some(200),
            FilterDecision::AbortNotFound | FilterDecision::AbortOther(_) => Some(404),
            _ => None,
        }
    }
}

impl From<String> for FilterDecision {
    fn from(s: String) -> Self {
        match s.as_str() {
            "pass_thru" => FilterDecision::PassThru,
            "abort_ok" => FilterDecision::AbortOk,
            "abort_not_found" => FilterDecision::AbortNotFound,
            "no_match" => FilterDecision::NoMatch,
            "match" => FilterDecision::Match,
            _ if s.starts_with("abort_") => FilterDecision::AbortOther(s),
            _ => FilterDecision::Unknown(s),
        }
    }
}

impl From<FilterDecision> for String {
    fn from(d: FilterDecision) -> Self {
        d.as_str().to_string()
    }
}

/// A filtering rule as returned by the remote matcher service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatcherRule {
    /// Matcher identifier.
    #[serde(rename = "uuid")]
    pub id: String,
    /// Name of the rule this matcher belongs to.
    #[serde(default)]
    pub rule: String,
    /// Pattern tested against the request path.
    #[serde(default)]
    pub url_regex: Option<String>,
    /// Pattern tested against the response content type.
    #[serde(default)]
    pub content_type_regex: Option<String>,
    /// Optional pattern tested against the user agent.
    #[serde(default)]
    pub user_agent_regex: Option<String>,
}

impl MatcherRule {
    /// Creates a rule with a url pattern.
    pub fn new(id: impl Into<String>, rule: impl Into<String>, url_regex: &str) -> Self {
        Self {
            id: id.into(),
            rule: rule.into(),
            url_regex: Some(url_regex.to_string()),
            content_type_regex: None,
            user_agent_regex: None,
        }
    }

    /// Sets the content type pattern.
    pub fn with_content_type(mut self, regex: impl Into<String>) -> Self {
        self.content_type_regex = Some(regex.into());
        self
    }

    /// Sets the user agent pattern.
    pub fn with_user_agent(mut self, regex: impl Into<String>) -> Self {
        self.user_agent_regex = Some(regex.into());
        self
    }
}

/// Response body of the matcher endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchersResponse {
    pub decision: FilterDecision,
    #[serde(default)]
    pub matchers: Vec<MatcherRule>,
}

// =============================================================================
// Flex routing
// =============================================================================

/// Alternate upstream router for a flex domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlexRouter {
    #[serde(rename = "proxyUrl", default)]
    pub proxy_url: Option<String>,
    #[serde(default)]
    pub port: Option<i32>,
    #[serde(default)]
    pub auth: Option<String>,
    /// Page to show when no router could be selected.
    #[serde(default)]
    pub error_html: Option<String>,
}

impl FlexRouter {
    /// Returns the router port if it is a usable TCP port.
    pub fn tcp_port(&self) -> Option<u16> {
        self.port
            .and_then(|p| u16::try_from(p).ok())
            .filter(|p| *p != 0)
    }

    /// True if the router can carry traffic.
    pub fn is_available(&self) -> bool {
        self.proxy_url.as_deref().is_some_and(|u| !u.is_empty()) && self.tcp_port().is_some()
    }
}

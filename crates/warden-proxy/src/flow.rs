//! Per-request flow state shared between the request and response phases.

use warden_core::MatcherRule;

/// Everything the router learns about a request that the response phase
/// needs later.
#[derive(Debug, Clone, Default)]
pub struct FlowContext {
    /// Client IP as a string.
    pub client: String,
    /// Address the client connected to (CONNECT authority host or Host).
    pub server: String,
    /// Host the request is for, when one could be attributed.
    pub host: Option<String>,
    /// True for requests inside an intercepted TLS connection.
    pub tls: bool,
    pub method: String,
    /// Absolute URL, used for filter bypass keys.
    pub url: String,
    /// Path plus query.
    pub path: String,
    pub user_agent: String,
    pub request_id: Option<String>,
    pub matchers: Vec<MatcherRule>,
    pub abort_code: Option<u16>,
    pub abort_location: Option<String>,
    /// Declared Content-Length of the response, removed when filtering.
    pub content_length: Option<u64>,
    pub flex: bool,
    pub passthru: bool,
    filtered: bool,
}

impl FlowContext {
    pub fn new(client: impl Into<String>, tls: bool) -> Self {
        Self {
            client: client.into(),
            tls,
            ..Self::default()
        }
    }

    /// Marks the flow as filtered. Returns false if it already was.
    pub fn mark_filtered(&mut self) -> bool {
        if self.filtered {
            return false;
        }
        self.filtered = true;
        true
    }

    pub fn is_filtered(&self) -> bool {
        self.filtered
    }

    /// True if the router attached matchers for the response phase.
    pub fn has_matchers(&self) -> bool {
        self.request_id.is_some() && !self.matchers.is_empty()
    }

    /// Host for logging; falls back to the server address.
    pub fn target(&self) -> &str {
        self.host.as_deref().unwrap_or(&self.server)
    }
}

//! Request router.
//!
//! Runs once per HTTP request, after the connection has been accepted. Asks
//! the policy service which filters apply, narrows them to the rules whose
//! patterns match this request, and either answers the request itself
//! (health check, redirect, abort) or lets it through with the surviving
//! matchers attached to the flow. Paths under the special prefix skip all of
//! this and are relayed to the policy service.

use std::sync::Arc;

use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderName, HOST, LOCATION, REFERER, USER_AGENT};
use hyper::http::request::Parts;
use hyper::Method;
use regex::Regex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use warden_core::config::WardenConfig;
use warden_core::host::parse_host_port;
use warden_core::{ActivityEvent, ActivityLog, FilterDecision, MatcherRule, Reason, Stage};

use crate::api::{MatchersRequest, PolicyApi};
use crate::flow::FlowContext;

/// Header set on health check responses.
pub const HEALTH_HEADER: HeaderName = HeaderName::from_static("x-warden-health");

const UNKNOWN_USER_AGENT: &str = "UNKNOWN";
const NO_REFERER: &str = "NONE";

/// A response the proxy produces without contacting the upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticResponse {
    pub status: u16,
    pub headers: Vec<(HeaderName, String)>,
    pub body: Bytes,
}

impl SyntheticResponse {
    /// Status with no headers and no body.
    pub fn empty(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn health() -> Self {
        Self {
            status: 200,
            headers: vec![(HEALTH_HEADER, "OK".to_string())],
            body: Bytes::from_static(b"OK\n"),
        }
    }

    pub fn redirect(status: u16, location: impl Into<String>) -> Self {
        Self {
            status,
            headers: vec![(LOCATION, location.into())],
            body: Bytes::new(),
        }
    }

    /// 200 with an HTML body.
    pub fn html(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            headers: vec![(
                hyper::header::CONTENT_TYPE,
                "text/html; charset=utf-8".to_string(),
            )],
            body: Bytes::from(body.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Send the request upstream.
    Forward,
    /// Answer the client directly.
    Respond(SyntheticResponse),
    /// Relay to the policy service; holds the path and query after the
    /// special prefix.
    Special(String),
}

/// Rules from `rules` whose url pattern matches `path` at its start and whose
/// user-agent pattern, if any, matches `user_agent`.
///
/// Rules without a url pattern or with a pattern that does not compile are
/// skipped.
pub fn matching_rules(rules: &[MatcherRule], path: &str, user_agent: &str) -> Vec<MatcherRule> {
    rules
        .iter()
        .filter(|rule| {
            let Some(pattern) = rule.url_regex.as_deref() else {
                debug!("Rule {} has no url pattern, skipping", rule.rule);
                return false;
            };
            if !compile_match(rule, pattern, path, true) {
                return false;
            }
            match rule.user_agent_regex.as_deref() {
                Some(ua_pattern) => compile_match(rule, ua_pattern, user_agent, false),
                None => true,
            }
        })
        .cloned()
        .collect()
}

fn compile_match(rule: &MatcherRule, pattern: &str, text: &str, anchored: bool) -> bool {
    let source = if anchored {
        format!("^(?:{})", pattern)
    } else {
        pattern.to_string()
    };
    match Regex::new(&source) {
        Ok(re) => re.is_match(text),
        Err(e) => {
            warn!("Rule {} has an invalid pattern {:?}: {}", rule.rule, pattern, e);
            false
        }
    }
}

fn header_or<'a>(headers: &'a HeaderMap, name: HeaderName, fallback: &'a str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(fallback)
}

#[derive(Clone)]
pub struct RequestRouter {
    config: Arc<WardenConfig>,
    api: Arc<dyn PolicyApi>,
    activity: Arc<dyn ActivityLog>,
}

impl RequestRouter {
    pub fn new(
        config: Arc<WardenConfig>,
        api: Arc<dyn PolicyApi>,
        activity: Arc<dyn ActivityLog>,
    ) -> Self {
        Self {
            config,
            api,
            activity,
        }
    }

    /// Routes one request, filling in `flow` for the response phase.
    ///
    /// For TLS flows `flow.host` must already hold the SNI.
    pub async fn route(&self, req: &Parts, flow: &mut FlowContext) -> RouteOutcome {
        let path = req
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        flow.method = req.method.as_str().to_string();
        flow.user_agent = header_or(&req.headers, USER_AGENT, UNKNOWN_USER_AGENT).to_string();
        flow.path = path.clone();

        if req.uri.path() == self.config.health_path {
            debug!("Health check from {}", flow.client);
            return RouteOutcome::Respond(SyntheticResponse::health());
        }

        if !flow.tls {
            flow.host = request_host(req);
        }
        let scheme = if flow.tls { "https" } else { "http" };
        flow.url = format!("{}://{}{}", scheme, flow.target(), path);

        if !flow.tls {
            if let Some(outcome) = self.route_plain(flow) {
                return outcome;
            }
        }

        if let Some(rest) = path.strip_prefix(self.config.special_path_prefix.as_str()) {
            return self.route_special(flow, &req.method, rest);
        }

        let Some(host) = flow.host.clone() else {
            warn!("No attributable host for {} from {}", path, flow.client);
            self.log(flow, "http_no_sni_or_host", Reason::NoHost);
            return RouteOutcome::Forward;
        };

        if self.config.is_control_host(&host) {
            debug!("Request for {} is for the proxy itself, not matching", host);
            return RouteOutcome::Forward;
        }

        let request_id = format!("{}.{}", host, Uuid::new_v4());
        let matchers_request = MatchersRequest {
            request_id: request_id.clone(),
            fqdn: host.clone(),
            uri: path.clone(),
            user_agent: flow.user_agent.clone(),
            referer: header_or(&req.headers, REFERER, NO_REFERER).to_string(),
            client_addr: flow.client.clone(),
            server_addr: flow.server.clone(),
        };

        let response = match self.api.matchers(&matchers_request).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Matcher lookup for {} failed, allowing: {}", flow.url, e);
                self.log(flow, "http_no_matcher_response", Reason::MatchersError);
                return RouteOutcome::Forward;
            }
        };

        if response.decision == FilterDecision::PassThru {
            debug!("Pass-thru for {}", flow.url);
            flow.passthru = true;
            self.log(flow, "http_passthru", Reason::PassThru);
            return RouteOutcome::Forward;
        }

        if let Some(status) = response.decision.abort_status() {
            info!(
                "Aborting {} from {} with {} ({})",
                flow.url,
                flow.client,
                status,
                response.decision.as_str()
            );
            flow.abort_code = Some(status);
            self.log(flow, &format!("http_abort{}", status), Reason::Abort);
            return RouteOutcome::Respond(SyntheticResponse::empty(status));
        }

        if response.decision == FilterDecision::NoMatch {
            self.log(flow, "http_no_match", Reason::NoMatch);
            return RouteOutcome::Forward;
        }

        let matched = matching_rules(&response.matchers, &path, &flow.user_agent);
        if matched.is_empty() {
            debug!("No rules matched {}", flow.url);
            self.log(flow, "http_no_rules", Reason::NoMatchers);
            return RouteOutcome::Forward;
        }

        debug!("{} rule(s) matched {} as {}", matched.len(), flow.url, request_id);
        flow.request_id = Some(request_id);
        flow.matchers = matched;
        self.log(flow, "http_match", Reason::Matched);
        RouteOutcome::Forward
    }

    /// Special paths take GET or POST only; matchers are never looked up.
    fn route_special(&self, flow: &mut FlowContext, method: &Method, rest: &str) -> RouteOutcome {
        if *method != Method::GET && *method != Method::POST {
            warn!("Special path {} does not take {}", flow.path, method);
            flow.abort_code = Some(405);
            return RouteOutcome::Respond(SyntheticResponse::empty(405));
        }
        debug!("Relaying special path {} from {}", flow.path, flow.client);
        self.log(flow, "http_special", Reason::SpecialPath);
        RouteOutcome::Special(rest.to_string())
    }

    /// Checks that only apply to plain HTTP.
    fn route_plain(&self, flow: &mut FlowContext) -> Option<RouteOutcome> {
        if let Some(host) = flow.host.as_deref() {
            if self.config.is_control_host(host) || self.config.is_management_host(host) {
                let location = format!("https://{}{}", host, flow.path);
                debug!("Redirecting {} to {}", flow.url, location);
                flow.abort_code = Some(301);
                flow.abort_location = Some(location.clone());
                self.log(flow, "http_redirect_https", Reason::RedirectHttps);
                return Some(RouteOutcome::Respond(SyntheticResponse::redirect(301, location)));
            }
        }

        if !self.config.local_network.contains_str(&flow.client) {
            warn!("Sending non-local client {} to the tarpit", flow.client);
            let location = self.config.tarpit_url.clone();
            flow.abort_code = Some(302);
            flow.abort_location = Some(location.clone());
            self.log(flow, "http_tarpit_non_vpn", Reason::Tarpit);
            return Some(RouteOutcome::Respond(SyntheticResponse::redirect(302, location)));
        }

        None
    }

    fn log(&self, flow: &FlowContext, action: &str, reason: Reason) {
        self.activity.record(ActivityEvent::new(
            Stage::Request,
            &flow.client,
            &flow.url,
            action,
            reason,
        ));
    }
}

/// Host of a plain HTTP request: the Host header, or the authority of an
/// absolute-form URI.
fn request_host(req: &Parts) -> Option<String> {
    req.headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_host_port)
        .or_else(|| req.uri.authority().and_then(|a| parse_host_port(a.as_str())))
        .map(|hp| hp.host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakePolicyApi, Fixture};
    use hyper::header::HeaderValue;
    use hyper::Request;

    fn router(fx: &Fixture) -> RequestRouter {
        RequestRouter::new(fx.config.clone(), fx.api.clone(), fx.activity.clone())
    }

    fn tls_flow(host: &str) -> FlowContext {
        let mut flow = FlowContext::new("10.0.0.2", true);
        flow.server = "93.184.216.34".into();
        flow.host = Some(host.into());
        flow
    }

    fn get(uri: &str) -> Parts {
        parts(
            Request::builder()
                .uri(uri)
                .header(USER_AGENT, "Mozilla/5.0")
                .body(())
                .unwrap(),
        )
    }

    fn parts(req: Request<()>) -> Parts {
        req.into_parts().0
    }

    fn rules() -> Vec<MatcherRule> {
        vec![
            MatcherRule::new("m1", "ads", "/ads/.*"),
            MatcherRule::new("m2", "all", ".*"),
        ]
    }

    #[test]
    fn url_patterns_anchor_at_path_start() {
        let rules = vec![MatcherRule::new("m1", "ads", "/ads/")];
        assert_eq!(matching_rules(&rules, "/ads/banner.js", "ua").len(), 1);
        assert!(matching_rules(&rules, "/static/ads/banner.js", "ua").is_empty());
    }

    #[test]
    fn rules_without_or_with_broken_patterns_are_skipped() {
        let mut no_pattern = MatcherRule::new("m1", "none", "");
        no_pattern.url_regex = None;
        let broken = MatcherRule::new("m2", "broken", "(unclosed");
        let good = MatcherRule::new("m3", "good", "/");

        let matched = matching_rules(&[no_pattern, broken, good], "/page", "ua");
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, "m3");
    }

    #[test]
    fn user_agent_pattern_must_also_match() {
        let rule = MatcherRule::new("m1", "mobile", "/").with_user_agent("iPhone");
        assert_eq!(matching_rules(&[rule.clone()], "/", "Mozilla (iPhone)").len(), 1);
        assert!(matching_rules(&[rule], "/", "Mozilla (X11)").is_empty());
    }

    #[tokio::test]
    async fn health_path_answers_without_lookup() {
        let fx = Fixture::new(FakePolicyApi::new());
        let mut flow = tls_flow("example.com");

        let outcome = router(&fx)
            .route(&get("https://example.com/__warden__/health"), &mut flow)
            .await;

        let RouteOutcome::Respond(response) = outcome else {
            panic!("expected a health response");
        };
        assert_eq!(response.status, 200);
        assert_eq!(response.body.len(), 3);
        assert_eq!(response.headers[0].0, HEALTH_HEADER);
        assert_eq!(fx.api.matchers_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn special_path_skips_matcher_lookup() {
        let fx = Fixture::new(FakePolicyApi::new().with_matchers(FilterDecision::Match, rules()));
        let mut flow = tls_flow("example.com");

        let outcome = router(&fx)
            .route(&get("https://example.com/__warden__/devices/status?v=1"), &mut flow)
            .await;

        assert_eq!(outcome, RouteOutcome::Special("devices/status?v=1".into()));
        assert!(!flow.has_matchers());
        assert_eq!(fx.activity.last().unwrap().reason, Reason::SpecialPath);
        assert_eq!(fx.api.matchers_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn special_path_refuses_other_methods() {
        let fx = Fixture::new(FakePolicyApi::new());
        let mut flow = FlowContext::new("10.0.0.2", false);
        let req = Request::builder()
            .method(Method::DELETE)
            .uri("http://example.com/__warden__/devices/1")
            .body(())
            .unwrap();

        let outcome = router(&fx).route(&parts(req), &mut flow).await;

        assert_eq!(outcome, RouteOutcome::Respond(SyntheticResponse::empty(405)));
        assert_eq!(fx.api.matchers_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn matched_rules_attach_to_flow() {
        let api = FakePolicyApi::new().with_matchers(FilterDecision::Match, rules());
        let fx = Fixture::new(api);
        let mut flow = tls_flow("example.com");

        let outcome = router(&fx)
            .route(&get("https://example.com/index.html?q=1"), &mut flow)
            .await;

        assert_eq!(outcome, RouteOutcome::Forward);
        assert!(flow.has_matchers());
        assert_eq!(flow.matchers.len(), 1);
        assert_eq!(flow.matchers[0].id, "m2");
        assert!(flow.request_id.as_deref().unwrap().starts_with("example.com."));
        assert_eq!(flow.url, "https://example.com/index.html?q=1");
        assert_eq!(fx.activity.last().unwrap().action, "http_match");

        let sent = fx.api.last_matchers_request.lock().clone().unwrap();
        assert_eq!(sent.uri, "/index.html?q=1");
        assert_eq!(sent.user_agent, "Mozilla/5.0");
        assert_eq!(sent.referer, NO_REFERER);
        assert_eq!(sent.server_addr, "93.184.216.34");
    }

    #[tokio::test]
    async fn missing_user_agent_is_unknown() {
        let fx = Fixture::new(FakePolicyApi::new());
        let mut flow = tls_flow("example.com");
        let mut req = Request::builder().uri("https://example.com/").body(()).unwrap();
        req.headers_mut()
            .insert(REFERER, HeaderValue::from_bytes(b"https://\xff/").unwrap());

        router(&fx).route(&parts(req), &mut flow).await;

        let sent = fx.api.last_matchers_request.lock().clone().unwrap();
        assert_eq!(sent.user_agent, UNKNOWN_USER_AGENT);
        assert_eq!(sent.referer, NO_REFERER);
    }

    #[tokio::test]
    async fn aborts_answer_with_empty_status() {
        let cases = [
            (FilterDecision::AbortOk, 200),
            (FilterDecision::AbortNotFound, 404),
            (FilterDecision::AbortOther("abort_teapot".into()), 404),
        ];
        for (decision, status) in cases {
            let fx = Fixture::new(FakePolicyApi::new().with_matchers(decision, rules()));
            let mut flow = tls_flow("example.com");

            let outcome = router(&fx).route(&get("https://example.com/ads/x"), &mut flow).await;

            assert_eq!(outcome, RouteOutcome::Respond(SyntheticResponse::empty(status)));
            assert_eq!(flow.abort_code, Some(status));
            assert!(!flow.has_matchers());
        }
    }

    #[tokio::test]
    async fn pass_thru_and_no_match_allow() {
        let fx = Fixture::new(FakePolicyApi::new().with_matchers(FilterDecision::PassThru, rules()));
        let mut flow = tls_flow("example.com");
        let outcome = router(&fx).route(&get("https://example.com/"), &mut flow).await;
        assert_eq!(outcome, RouteOutcome::Forward);
        assert!(flow.passthru);
        assert!(!flow.has_matchers());

        let fx = Fixture::new(FakePolicyApi::new().with_matchers(FilterDecision::NoMatch, rules()));
        let mut flow = tls_flow("example.com");
        router(&fx).route(&get("https://example.com/"), &mut flow).await;
        assert!(!flow.passthru);
        assert!(!flow.has_matchers());
        assert_eq!(fx.activity.last().unwrap().reason, Reason::NoMatch);
    }

    #[tokio::test]
    async fn lookup_failure_allows_unfiltered() {
        let fx = Fixture::new(FakePolicyApi::new().with_matchers_status(500));
        let mut flow = tls_flow("example.com");

        let outcome = router(&fx).route(&get("https://example.com/"), &mut flow).await;

        assert_eq!(outcome, RouteOutcome::Forward);
        assert!(!flow.has_matchers());
        assert_eq!(fx.activity.last().unwrap().reason, Reason::MatchersError);
    }

    #[tokio::test]
    async fn plain_http_to_control_host_redirects_to_https() {
        let config = WardenConfig::default().with_control_host("warden.local");
        let fx = Fixture::with_config(config, FakePolicyApi::new());
        let mut flow = FlowContext::new("10.0.0.2", false);
        let req = Request::builder()
            .uri("/setup?step=1")
            .header(HOST, "warden.local:80")
            .body(())
            .unwrap();

        let outcome = router(&fx).route(&parts(req), &mut flow).await;

        assert_eq!(
            outcome,
            RouteOutcome::Respond(SyntheticResponse::redirect(301, "https://warden.local/setup?step=1"))
        );
        assert_eq!(fx.api.matchers_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn plain_http_from_foreign_client_goes_to_tarpit() {
        let fx = Fixture::new(FakePolicyApi::new());
        let mut flow = FlowContext::new("198.51.100.7", false);

        let outcome = router(&fx).route(&get("http://example.com/"), &mut flow).await;

        let RouteOutcome::Respond(response) = outcome else {
            panic!("expected a tarpit redirect");
        };
        assert_eq!(response.status, 302);
        assert_eq!(response.headers[0].1, fx.config.tarpit_url);
        assert_eq!(fx.activity.last().unwrap().reason, Reason::Tarpit);
    }

    #[tokio::test]
    async fn plain_http_without_host_is_forwarded() {
        let fx = Fixture::new(FakePolicyApi::new());
        let mut flow = FlowContext::new("10.0.0.2", false);
        let req = Request::builder().uri("/").body(()).unwrap();

        let outcome = router(&fx).route(&parts(req), &mut flow).await;

        assert_eq!(outcome, RouteOutcome::Forward);
        assert_eq!(fx.activity.last().unwrap().reason, Reason::NoHost);
    }

    #[tokio::test]
    async fn plain_http_host_header_includes_ipv6() {
        let fx = Fixture::new(FakePolicyApi::new());
        let mut flow = FlowContext::new("10.0.0.2", false);
        let req = Request::builder()
            .uri("/")
            .header(HOST, "[fd00::1]:8080")
            .body(())
            .unwrap();

        router(&fx).route(&parts(req), &mut flow).await;

        assert_eq!(flow.host.as_deref(), Some("fd00::1"));
    }
}

//! hudsucker handler.
//!
//! Adapts the proxy engine's hooks to the policy components. A CONNECT is
//! decided by the gatekeeper, every request inside it (or every plain HTTP
//! request) goes through the router and, for flex hosts, the flex router;
//! responses go through the filter pipeline. Special paths are relayed to the
//! policy service and returned unfiltered.

use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hudsucker::{
    hyper::{Method, Request, Response, StatusCode},
    Body, HttpContext, HttpHandler, RequestOrResponse,
};
use hyper::body::Bytes;
use hyper::http::uri::Scheme;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::net::TcpStream;

use warden_core::config::WardenConfig;
use warden_core::host::{is_ip_literal, parse_host_port, HostPort};
use warden_core::ActivityLog;
use warden_storage::PolicyView;

use crate::api::{PolicyApi, SpecialResponse};
use crate::flex::{FlexResolution, FlexResponse, FlexRouting};
use crate::flow::FlowContext;
use crate::gatekeeper::{ConnectionGate, GateState, Gatekeeper, HandshakeReporter};
use crate::pipeline::{spawn_relay, FilterPipeline};
use crate::router::{RequestRouter, RouteOutcome, SyntheticResponse};

/// Helper to convert bytes to Body
fn bytes_to_body(bytes: Bytes) -> Body {
    Body::from(Full::new(bytes))
}

fn status_response(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

/// Builds the hyper response for a synthetic answer.
pub fn into_response(synthetic: SyntheticResponse) -> Response<Body> {
    let mut builder = Response::builder().status(synthetic.status);
    for (name, value) in &synthetic.headers {
        builder = builder.header(name, value.as_str());
    }
    match builder.body(bytes_to_body(synthetic.body)) {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!("Invalid synthetic response: {}", e);
            status_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// State of the CONNECT a handler was cloned from.
#[derive(Clone)]
struct ConnState {
    host: String,
    gate: ConnectionGate,
    /// Shared by every request on the connection; the first one reports.
    reporter: Arc<Mutex<Option<HandshakeReporter>>>,
}

/// Proxy handler. hudsucker clones it per connection and per request, so
/// connection state set on CONNECT is seen by the requests inside it.
#[derive(Clone)]
pub struct WardenHandler {
    api: Arc<dyn PolicyApi>,
    gatekeeper: Gatekeeper,
    router: RequestRouter,
    pipeline: FilterPipeline,
    flex: FlexRouting,
    conn: Option<ConnState>,
    flow: Option<FlowContext>,
}

impl std::fmt::Debug for WardenHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WardenHandler")
            .field("conn", &self.conn.as_ref().map(|c| &c.host))
            .field("flow", &self.flow.as_ref().map(|f| &f.url))
            .finish()
    }
}

impl WardenHandler {
    pub fn new(
        config: Arc<WardenConfig>,
        policy: PolicyView,
        api: Arc<dyn PolicyApi>,
        activity: Arc<dyn ActivityLog>,
    ) -> Self {
        Self {
            api: api.clone(),
            gatekeeper: Gatekeeper::new(config.clone(), policy.clone(), api.clone(), activity.clone()),
            router: RequestRouter::new(config.clone(), api.clone(), activity.clone()),
            pipeline: FilterPipeline::new(config.clone(), policy.clone(), api.clone(), activity.clone()),
            flex: FlexRouting::new(config, policy, api, activity),
            conn: None,
            flow: None,
        }
    }

    /// Decides a CONNECT. Blocked connections are refused; passthru
    /// connections to a flex host are spliced to the flex router.
    async fn on_connect(&mut self, client: &str, mut req: Request<Body>) -> RequestOrResponse {
        let Some(authority) = req.uri().authority().cloned() else {
            tracing::warn!("CONNECT from {} without authority", client);
            return RequestOrResponse::Response(status_response(StatusCode::BAD_REQUEST));
        };
        let Some(HostPort { host, port }) = parse_host_port(authority.as_str()) else {
            tracing::warn!("CONNECT from {} to unparseable {}", client, authority);
            return RequestOrResponse::Response(status_response(StatusCode::BAD_REQUEST));
        };
        let port = port.unwrap_or(443);
        let sni = if is_ip_literal(&host) { None } else { Some(host.as_str()) };

        let gate = self.gatekeeper.on_next_layer(client, &host, sni).await;
        match gate.state() {
            GateState::Blocked => {
                tracing::info!("Refusing CONNECT {} from {}", authority, client);
                return RequestOrResponse::Response(status_response(StatusCode::FORBIDDEN));
            }
            GateState::Passthru => {
                if let Some(response) = self.flex_tunnel(client, &gate, port, &mut req).await {
                    return RequestOrResponse::Response(response);
                }
            }
            GateState::Intercepting | GateState::Undecided => {}
        }

        let reporter = self.gatekeeper.watch_handshake(&gate);
        self.conn = Some(ConnState {
            host,
            gate,
            reporter: Arc::new(Mutex::new(reporter)),
        });
        RequestOrResponse::Request(req)
    }

    /// Opens a flex tunnel for a passthru connection, if its host is a flex
    /// domain with a router. Returns the response that accepts the CONNECT.
    async fn flex_tunnel(
        &self,
        client: &str,
        gate: &ConnectionGate,
        port: u16,
        req: &mut Request<Body>,
    ) -> Option<Response<Body>> {
        let fqdn = self.flex.flex_fqdn(client, &gate.fqdns)?;
        let FlexResolution::Router(router) = self.flex.resolve(client, fqdn).await else {
            return None;
        };

        let authority = format!("{}:{}", fqdn, port);
        let upstream = match self.flex.open_tunnel(&router, client, &authority).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("Flex tunnel for {} failed, passing through: {}", authority, e);
                return None;
            }
        };

        tokio::spawn(splice(hyper::upgrade::on(req), upstream, authority));
        Some(status_response(StatusCode::OK))
    }

    /// Routes a request, inside a CONNECT or plain.
    async fn on_request(&mut self, client: &str, req: Request<Body>) -> RequestOrResponse {
        let tls = req.uri().scheme() == Some(&Scheme::HTTPS);
        let mut flow = FlowContext::new(client, tls);

        match &self.conn {
            Some(conn) => {
                if let Some(reporter) = conn.reporter.lock().take() {
                    reporter.established();
                }
                flow.server = conn.host.clone();
                if tls {
                    flow.host = conn
                        .gate
                        .sni()
                        .map(str::to_string)
                        .or_else(|| req.uri().host().map(str::to_lowercase));
                }
            }
            None => {
                flow.server = req.uri().host().map(str::to_lowercase).unwrap_or_default();
            }
        }

        let (parts, body) = req.into_parts();
        match self.router.route(&parts, &mut flow).await {
            RouteOutcome::Respond(synthetic) => {
                return RequestOrResponse::Response(into_response(synthetic));
            }
            RouteOutcome::Special(rest) => {
                let response = self.special_response(client, parts.method.clone(), &rest, body).await;
                return RequestOrResponse::Response(response);
            }
            RouteOutcome::Forward => {}
        }

        let flex_host = flow
            .host
            .clone()
            .filter(|host| self.flex.is_flex(client, host));
        let Some(flex_host) = flex_host else {
            self.flow = Some(flow);
            return RequestOrResponse::Request(Request::from_parts(parts, body));
        };

        match self.flex.resolve(client, &flex_host).await {
            FlexResolution::Router(router) => {
                let body_bytes = match body.collect().await {
                    Ok(collected) => collected.to_bytes(),
                    Err(e) => {
                        tracing::warn!("Failed to read request body for {}: {}", flow.url, e);
                        self.flow = Some(flow);
                        return RequestOrResponse::Request(Request::from_parts(parts, Body::empty()));
                    }
                };
                match self.flex.reproxy(&router, &flow, &parts, body_bytes.clone()).await {
                    Ok(response) => {
                        flow.flex = true;
                        RequestOrResponse::Response(self.flex_response(flow, response))
                    }
                    Err(e) => {
                        tracing::warn!("Flex request for {} failed, going direct: {}", flow.url, e);
                        self.flow = Some(flow);
                        RequestOrResponse::Request(Request::from_parts(parts, bytes_to_body(body_bytes)))
                    }
                }
            }
            FlexResolution::Fallback(html) => {
                RequestOrResponse::Response(into_response(SyntheticResponse::html(html)))
            }
            FlexResolution::Unavailable => {
                self.flow = Some(flow);
                RequestOrResponse::Request(Request::from_parts(parts, body))
            }
        }
    }

    /// Relays a special-path request to the policy service and streams its
    /// answer back as-is.
    async fn special_response(
        &self,
        client: &str,
        method: Method,
        rest: &str,
        body: Body,
    ) -> Response<Body> {
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::warn!("Failed to read special request body from {}: {}", client, e);
                return status_response(StatusCode::BAD_REQUEST);
            }
        };

        match self.api.relay_special(client, method, rest, body).await {
            Ok(SpecialResponse { status, headers, body }) => {
                let stream = spawn_relay::<_, _, hudsucker::Error>(None, body);
                let mut out = Response::new(Body::from_stream(stream));
                *out.status_mut() = status;
                *out.headers_mut() = headers;
                out
            }
            Err(e) => {
                tracing::warn!("Special request {} from {} failed: {}", rest, client, e);
                status_response(StatusCode::BAD_GATEWAY)
            }
        }
    }

    /// Streams a flex response back, filtered like any other. Non-2xx
    /// answers are returned without a body.
    fn flex_response(&self, mut flow: FlowContext, response: FlexResponse) -> Response<Body> {
        let FlexResponse {
            status,
            mut headers,
            body,
        } = response;

        let relay = self.pipeline.prepare(&mut flow, status, &mut headers);
        let body = if status.is_success() {
            Body::from_stream(spawn_relay::<_, _, hudsucker::Error>(relay, body.bytes_stream()))
        } else {
            Body::empty()
        };

        let mut out = Response::new(body);
        *out.status_mut() = status;
        *out.headers_mut() = headers;
        out
    }

    /// Sends a response through the filter pipeline.
    fn on_response(&mut self, res: Response<Body>) -> Response<Body> {
        let Some(mut flow) = self.flow.take() else {
            return res;
        };

        let (mut parts, body) = res.into_parts();
        match self.pipeline.prepare(&mut flow, parts.status, &mut parts.headers) {
            Some(relay) => {
                let stream = spawn_relay::<_, _, hudsucker::Error>(Some(relay), body.into_data_stream());
                Response::from_parts(parts, Body::from_stream(stream))
            }
            None => Response::from_parts(parts, body),
        }
    }

    fn intercepts(&self) -> bool {
        self.conn
            .as_ref()
            .is_some_and(|conn| conn.gate.state() == GateState::Intercepting)
    }
}

/// Copies bytes between the upgraded client connection and the tunnel.
async fn splice(on_upgrade: OnUpgrade, mut upstream: TcpStream, authority: String) {
    match on_upgrade.await {
        Ok(upgraded) => {
            let mut client = TokioIo::new(upgraded);
            match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                Ok((sent, received)) => tracing::debug!(
                    "Flex tunnel {} closed ({} bytes up, {} down)",
                    authority,
                    sent,
                    received
                ),
                Err(e) => tracing::debug!("Flex tunnel {} ended: {}", authority, e),
            }
        }
        Err(e) => tracing::warn!("Upgrade for flex tunnel {} failed: {}", authority, e),
    }
}

fn client_ip(ctx: &HttpContext) -> String {
    ctx.client_addr.ip().to_canonical().to_string()
}

impl HttpHandler for WardenHandler {
    async fn handle_request(&mut self, ctx: &HttpContext, req: Request<Body>) -> RequestOrResponse {
        let client = client_ip(ctx);
        if req.method() == Method::CONNECT {
            self.on_connect(&client, req).await
        } else {
            self.on_request(&client, req).await
        }
    }

    async fn handle_response(&mut self, _ctx: &HttpContext, res: Response<Body>) -> Response<Body> {
        self.on_response(res)
    }

    async fn should_intercept(&mut self, _ctx: &HttpContext, _req: &Request<Body>) -> bool {
        self.intercepts()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{FilterOutcome, HttpPolicyApi};
    use crate::testing::{bytes, FakePolicyApi, Fixture};
    use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE, USER_AGENT};
    use tokio::net::TcpListener;
    use warden_core::config::ApiConfig;
    use warden_core::{CheckVerdict, FilterDecision, FlexRouter, MatcherRule, Reason};
    use wiremock::matchers::{header, method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn handler(fx: &Fixture) -> WardenHandler {
        WardenHandler::new(
            fx.config.clone(),
            fx.policy.clone(),
            fx.api.clone(),
            fx.activity.clone(),
        )
    }

    fn connect(authority: &str) -> Request<Body> {
        Request::builder()
            .method(Method::CONNECT)
            .uri(authority)
            .body(Body::empty())
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(USER_AGENT, "Mozilla/5.0")
            .body(Body::empty())
            .unwrap()
    }

    fn html(body: &str) -> Response<Body> {
        Response::builder()
            .header(CONTENT_TYPE, "text/html")
            .header(CONTENT_LENGTH, body.len())
            .body(bytes_to_body(bytes(body)))
            .unwrap()
    }

    async fn body_text(res: Response<Body>) -> String {
        let collected = res.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(collected.to_vec()).unwrap()
    }

    #[test]
    fn synthetic_response_keeps_status_and_headers() {
        let response = into_response(SyntheticResponse::redirect(302, "http://tarpit.local/"));
        assert_eq!(response.status(), 302);
        assert_eq!(response.headers().get("location").unwrap(), "http://tarpit.local/");
    }

    #[tokio::test]
    async fn blocked_connect_is_refused() {
        let fx = Fixture::new(FakePolicyApi::new().with_verdict(CheckVerdict::Block));
        let mut h = handler(&fx);

        let outcome = h.on_connect("10.0.0.2", connect("tracker.example:443")).await;

        let RequestOrResponse::Response(response) = outcome else {
            panic!("expected a response");
        };
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(!h.intercepts());
    }

    #[tokio::test]
    async fn intercepted_connect_is_handed_to_tls() {
        let fx = Fixture::new(FakePolicyApi::new());
        let mut h = handler(&fx);

        let outcome = h.on_connect("10.0.0.2", connect("example.com:443")).await;

        assert!(matches!(outcome, RequestOrResponse::Request(_)));
        assert!(h.intercepts());
        assert_eq!(fx.api.checks(), 1);
    }

    #[tokio::test]
    async fn passthru_connect_is_not_intercepted() {
        let fx = Fixture::new(FakePolicyApi::new().with_verdict(CheckVerdict::Passthru));
        let mut h = handler(&fx);

        let outcome = h.on_connect("10.0.0.2", connect("bank.example:443")).await;

        assert!(matches!(outcome, RequestOrResponse::Request(_)));
        assert!(!h.intercepts());
    }

    #[tokio::test]
    async fn health_check_is_answered_locally() {
        let fx = Fixture::new(FakePolicyApi::new());
        let mut h = handler(&fx);
        let uri = format!("http://example.com{}", fx.config.health_path);

        let RequestOrResponse::Response(response) = h.on_request("10.0.0.2", get(&uri)).await else {
            panic!("expected a response");
        };
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "OK\n");
    }

    #[tokio::test]
    async fn intercepted_request_is_filtered_on_the_way_back() {
        let api = FakePolicyApi::new()
            .with_matchers(FilterDecision::Match, vec![MatcherRule::new("m1", "ads", "/.*")])
            .with_filter(|chunk| {
                Ok(FilterOutcome::Filtered(Bytes::from(chunk.data.to_ascii_uppercase())))
            });
        let fx = Fixture::new(api);
        let mut h = handler(&fx);
        h.on_connect("10.0.0.2", connect("example.com:443")).await;

        let mut inner = h.clone();
        let outcome = inner.on_request("10.0.0.2", get("https://example.com/index.html")).await;
        assert!(matches!(outcome, RequestOrResponse::Request(_)));

        let response = inner.on_response(html("<p>hello</p>"));
        assert!(response.headers().get(CONTENT_LENGTH).is_none());
        assert_eq!(body_text(response).await, "<P>HELLO</P>");
        assert_eq!(fx.activity.count_reason(Reason::FilterApplied), 1);
    }

    #[tokio::test]
    async fn unmatched_response_is_untouched() {
        let fx = Fixture::new(FakePolicyApi::new());
        let mut h = handler(&fx);
        h.on_connect("10.0.0.2", connect("example.com:443")).await;

        let mut inner = h.clone();
        inner.on_request("10.0.0.2", get("https://example.com/")).await;
        let response = inner.on_response(html("<p>hello</p>"));

        assert!(response.headers().get(CONTENT_LENGTH).is_some());
        assert_eq!(body_text(response).await, "<p>hello</p>");
        assert!(fx.api.recorded_chunks().is_empty());
    }

    #[tokio::test]
    async fn abort_is_answered_without_upstream() {
        let fx = Fixture::new(FakePolicyApi::new().with_matchers(FilterDecision::AbortNotFound, vec![]));
        let mut h = handler(&fx);
        h.on_connect("10.0.0.2", connect("ads.example:443")).await;

        let RequestOrResponse::Response(response) =
            h.clone().on_request("10.0.0.2", get("https://ads.example/pixel.gif")).await
        else {
            panic!("expected a response");
        };
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn flex_host_without_router_serves_fallback_page() {
        let page = FlexRouter {
            error_html: Some("<h1>no route</h1>".into()),
            ..FlexRouter::default()
        };
        let fx = Fixture::new(FakePolicyApi::new().with_flex_router(page));
        fx.policy.add_flex_include("10.0.0.2", "example.com");
        let mut h = handler(&fx);
        h.on_connect("10.0.0.2", connect("www.example.com:443")).await;

        let RequestOrResponse::Response(response) =
            h.clone().on_request("10.0.0.2", get("https://www.example.com/")).await
        else {
            panic!("expected a response");
        };
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "<h1>no route</h1>");
    }

    fn flex_router(proxy_url: &str, port: u16) -> FlexRouter {
        FlexRouter {
            proxy_url: Some(proxy_url.to_string()),
            port: Some(port as i32),
            auth: Some("Basic ZmxleDpmbGV4".to_string()),
            error_html: None,
        }
    }

    #[tokio::test]
    async fn connect_to_ip_literal_reads_dns_capture() {
        let fx = Fixture::new(FakePolicyApi::new());
        fx.policy.record_dns("2001:db8::1", "10.0.0.2", "example.com");
        let mut h = handler(&fx);

        let outcome = h.on_connect("10.0.0.2", connect("[2001:db8::1]:443")).await;

        assert!(matches!(outcome, RequestOrResponse::Request(_)));
        assert!(h.intercepts());
        let conn = h.conn.clone().unwrap();
        assert_eq!(conn.host, "2001:db8::1");
        assert_eq!(conn.gate.fqdns, vec!["example.com".to_string()]);
    }

    #[tokio::test]
    async fn connect_to_unnamed_ip_is_refused_by_default() {
        let fx = Fixture::new(FakePolicyApi::new());
        let mut h = handler(&fx);

        let RequestOrResponse::Response(response) =
            h.on_connect("10.0.0.9", connect("93.184.216.34:443")).await
        else {
            panic!("expected a refusal");
        };
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(fx.activity.last().unwrap().reason, Reason::NoFqdn);
        assert_eq!(fx.api.checks(), 0);
    }

    #[tokio::test]
    async fn special_path_is_relayed_to_policy_service() {
        let service = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/devices/status"))
            .and(header("x-forwarded-for", "10.0.0.2"))
            .and(header("accept", "application/json"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .set_body_string("<p>device ok</p>"),
            )
            .expect(1)
            .mount(&service)
            .await;
        Mock::given(path_regex("^/api/filter/"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&service)
            .await;

        let fx = Fixture::new(FakePolicyApi::new());
        let api = HttpPolicyApi::new(&ApiConfig {
            base_url: format!("{}/api", service.uri()),
            timeout_secs: 2,
        })
        .unwrap();
        let mut h = WardenHandler::new(
            fx.config.clone(),
            fx.policy.clone(),
            Arc::new(api),
            fx.activity.clone(),
        );

        let RequestOrResponse::Response(response) = h
            .on_request("10.0.0.2", get("http://example.com/__warden__/devices/status"))
            .await
        else {
            panic!("expected the service's answer");
        };
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "<p>device ok</p>");
        assert!(h.flow.is_none());
    }

    #[tokio::test]
    async fn special_path_skips_flex_and_filtering() {
        let api = FakePolicyApi::new()
            .with_special(201, "{\"saved\":true}")
            .with_flex_router(flex_router("http://127.0.0.1:9", 9100));
        let fx = Fixture::new(api);
        fx.policy.add_flex_include("10.0.0.2", "example.com");
        let mut h = handler(&fx);
        h.on_connect("10.0.0.2", connect("www.example.com:443")).await;

        let post = Request::builder()
            .method(Method::POST)
            .uri("https://www.example.com/__warden__/prefs/save")
            .body(bytes_to_body(bytes("{\"dark\":1}")))
            .unwrap();
        let RequestOrResponse::Response(response) = h.clone().on_request("10.0.0.2", post).await else {
            panic!("expected the service's answer");
        };

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(body_text(response).await, "{\"saved\":true}");
        assert_eq!(fx.api.flex_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(fx.api.matchers_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        let sent = fx.api.special_requests.lock().clone();
        assert_eq!(sent, vec![(Method::POST, "prefs/save".to_string(), bytes("{\"dark\":1}"))]);
    }

    #[tokio::test]
    async fn flex_response_is_filtered() {
        let proxy = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .and(header("proxy-authorization", "Basic ZmxleDpmbGV4"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .set_body_string("<p>via flex</p>"),
            )
            .expect(1)
            .mount(&proxy)
            .await;

        let api = FakePolicyApi::new()
            .with_matchers(FilterDecision::Match, vec![MatcherRule::new("m1", "all", ".*")])
            .with_filter(|chunk| {
                Ok(FilterOutcome::Filtered(Bytes::from(chunk.data.to_ascii_uppercase())))
            })
            .with_flex_router(flex_router(&proxy.uri(), 9100));
        let fx = Fixture::new(api);
        fx.policy.add_flex_include("10.0.0.2", "example.com");
        let mut h = handler(&fx);

        let RequestOrResponse::Response(response) =
            h.on_request("10.0.0.2", get("http://www.example.com/page")).await
        else {
            panic!("expected the flex response");
        };

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(CONTENT_LENGTH).is_none());
        assert_eq!(body_text(response).await, "<P>VIA FLEX</P>");
        assert_eq!(fx.activity.count_reason(Reason::FlexRouted), 1);
        assert_eq!(fx.activity.count_reason(Reason::FilterApplied), 1);
        assert_eq!(fx.api.last_calls(), 1);
    }

    #[tokio::test]
    async fn failed_flex_tunnel_falls_back_to_passthru() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = closed.local_addr().unwrap().port();
        drop(closed);

        let api = FakePolicyApi::new()
            .with_verdict(CheckVerdict::Passthru)
            .with_flex_router(flex_router("http://127.0.0.1:9", dead_port));
        let fx = Fixture::new(api);
        fx.policy.add_flex_include("10.0.0.2", "example.com");
        let mut h = handler(&fx);

        let outcome = h.on_connect("10.0.0.2", connect("www.example.com:443")).await;

        assert!(matches!(outcome, RequestOrResponse::Request(_)));
        assert!(!h.intercepts());
        assert_eq!(fx.api.flex_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(fx.activity.count_reason(Reason::FlexTunnel), 0);
    }

    #[tokio::test]
    async fn first_inner_request_confirms_handshake() {
        let fx = Fixture::new(FakePolicyApi::new());
        let mut h = handler(&fx);
        h.on_connect("10.0.0.2", connect("example.com:443")).await;
        let conn = h.conn.clone().unwrap();
        assert!(conn.reporter.lock().is_some());

        h.clone().on_request("10.0.0.2", get("https://example.com/")).await;

        assert!(conn.reporter.lock().is_none());
    }
}

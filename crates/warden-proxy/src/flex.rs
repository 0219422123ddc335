//! Flex routing.
//!
//! Clients can opt domains into "flex" routing, which sends their traffic
//! through an alternate router instead of straight upstream. Intercepted
//! requests are re-issued through the router's HTTP proxy and still filtered;
//! passthru connections are spliced to the router's local tunnel port.

use std::sync::Arc;

use dashmap::DashMap;
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderName, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use hyper::http::request::Parts;
use hyper::StatusCode;
use reqwest::header::HeaderValue;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use warden_core::config::WardenConfig;
use warden_core::{ActivityEvent, ActivityLog, FlexRouter, Reason, Stage};
use warden_storage::PolicyView;

use crate::api::PolicyApi;
use crate::error::{ProxyError, Result};
use crate::flow::FlowContext;

/// Upper bound on the tunnel's CONNECT response head.
const MAX_PREAMBLE_RESPONSE: usize = 8 * 1024;

/// Headers that describe one hop and are not re-sent through the router.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// How a flex request should be carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlexResolution {
    /// Route through this router.
    Router(FlexRouter),
    /// No router; answer with this page.
    Fallback(String),
    /// No router and no page; go direct.
    Unavailable,
}

#[derive(Clone)]
pub struct FlexRouting {
    config: Arc<WardenConfig>,
    policy: PolicyView,
    api: Arc<dyn PolicyApi>,
    activity: Arc<dyn ActivityLog>,
    /// One client per (proxy url, auth).
    clients: Arc<DashMap<(String, Option<String>), reqwest::Client>>,
}

impl FlexRouting {
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
            clients: Arc::new(DashMap::new()),
        }
    }

    /// True if `host` is a flex domain for `client`. The proxy's own hosts
    /// never are.
    pub fn is_flex(&self, client: &str, host: &str) -> bool {
        if self.config.is_control_host(host)
            || self.config.is_management_host(host)
            || self.config.is_cert_probe_host(host)
        {
            return false;
        }
        self.policy.is_flex_domain(client, host)
    }

    /// First of `fqdns` that is a flex domain for `client`.
    pub fn flex_fqdn<'a>(&self, client: &str, fqdns: &'a [String]) -> Option<&'a str> {
        fqdns
            .iter()
            .map(String::as_str)
            .find(|fqdn| self.is_flex(client, fqdn))
    }

    /// Looks up the router for a flex host.
    ///
    /// A router carrying an error page resolves to that page; lookup
    /// failures resolve to [`FlexResolution::Unavailable`].
    pub async fn resolve(&self, client: &str, host: &str) -> FlexResolution {
        let router = match self.api.flex_router(client, host).await {
            Ok(router) => router,
            Err(e) => {
                warn!("Flex router lookup failed for {} ({}): {}", host, client, e);
                None
            }
        };

        let resolution = match router {
            Some(router) if router.error_html.as_deref().is_some_and(|h| !h.is_empty()) => {
                FlexResolution::Fallback(router.error_html.unwrap_or_default())
            }
            Some(router) if router.is_available() => FlexResolution::Router(router),
            _ => FlexResolution::Unavailable,
        };

        let (action, reason) = match &resolution {
            FlexResolution::Router(router) => {
                info!(
                    "Flex host {} for {} routed via {}",
                    host,
                    client,
                    router.proxy_url.as_deref().unwrap_or_default()
                );
                ("flex_route", Reason::FlexRouted)
            }
            FlexResolution::Fallback(_) => {
                debug!("No flex router for {} ({}), serving fallback page", host, client);
                ("flex_fallback", Reason::FlexFallback)
            }
            FlexResolution::Unavailable => {
                warn!("No flex router for {} ({}), going direct", host, client);
                ("flex_direct", Reason::FlexUnavailable)
            }
        };
        self.activity
            .record(ActivityEvent::new(Stage::Flex, client, host, action, reason));

        resolution
    }

    fn client_for(&self, router: &FlexRouter) -> Result<reqwest::Client> {
        let proxy_url = router
            .proxy_url
            .clone()
            .ok_or_else(|| ProxyError::Flex("router has no proxy url".into()))?;
        let key = (proxy_url, router.auth.clone());
        if let Some(client) = self.clients.get(&key) {
            return Ok(client.clone());
        }

        let mut proxy =
            reqwest::Proxy::all(key.0.as_str()).map_err(|e| ProxyError::Flex(e.to_string()))?;
        if let Some(auth) = router.auth.as_deref() {
            let value = HeaderValue::from_str(auth)
                .map_err(|e| ProxyError::Flex(format!("invalid router auth: {}", e)))?;
            proxy = proxy.custom_http_auth(value);
        }
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(self.config.flex.timeout())
            .build()
            .map_err(|e| ProxyError::Flex(e.to_string()))?;

        self.clients.insert(key, client.clone());
        Ok(client)
    }

    /// Re-issues a request through `router` and returns the upstream
    /// response with its framing headers removed.
    pub async fn reproxy(
        &self,
        router: &FlexRouter,
        flow: &FlowContext,
        parts: &Parts,
        body: Bytes,
    ) -> Result<FlexResponse> {
        let client = self.client_for(router)?;
        let scheme = if flow.tls { "https" } else { "http" };
        let url = format!("{}://{}{}", scheme, flow.target(), flow.path);

        let mut request = client.request(parts.method.clone(), &url);
        for (name, value) in parts.headers.iter() {
            if is_forwardable(name) {
                request = request.header(name.clone(), value.clone());
            }
        }
        if !body.is_empty() {
            request = request.body(body);
        }

        debug!("Flex request {} {} via router", parts.method, url);
        let response = request
            .send()
            .await
            .map_err(|e| ProxyError::Flex(format!("{} {}: {}", parts.method, url, e)))?;

        let status = response.status();
        let mut headers = response.headers().clone();
        headers.remove(CONTENT_LENGTH);
        headers.remove(TRANSFER_ENCODING);
        info!("Flex response {} for {}", status, url);

        Ok(FlexResponse {
            status,
            headers,
            body: response,
        })
    }

    /// Connects to the router's tunnel port and asks it for `authority`.
    pub async fn open_tunnel(&self, router: &FlexRouter, client: &str, authority: &str) -> Result<TcpStream> {
        let port = router
            .tcp_port()
            .ok_or_else(|| ProxyError::Flex("router has no tunnel port".into()))?;
        let host = self.config.flex.tunnel_host.as_str();

        let connect = async {
            let mut stream = TcpStream::connect((host, port)).await?;
            connect_preamble(&mut stream, authority).await?;
            Ok::<_, ProxyError>(stream)
        };
        let stream = tokio::time::timeout(self.config.flex.timeout(), connect)
            .await
            .map_err(|_| ProxyError::Flex(format!("tunnel to {}:{} timed out", host, port)))??;

        info!("Flex tunnel for {} ({}) via {}:{}", authority, client, host, port);
        self.activity.record(ActivityEvent::new(
            Stage::Flex,
            client,
            authority,
            "flex_tunnel",
            Reason::FlexTunnel,
        ));
        Ok(stream)
    }
}

/// Upstream answer to a re-proxied request.
pub struct FlexResponse {
    pub status: StatusCode,
    /// Response headers without Content-Length or Transfer-Encoding.
    pub headers: HeaderMap,
    pub body: reqwest::Response,
}

fn is_forwardable(name: &HeaderName) -> bool {
    *name != HOST && *name != CONTENT_LENGTH && !HOP_BY_HOP.contains(&name.as_str())
}

/// Sends `CONNECT authority` on `stream` and consumes the response head.
///
/// Reads byte by byte so nothing past the head is taken from the tunnel.
pub async fn connect_preamble<S>(stream: &mut S, authority: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!(
        "CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n",
        authority
    );
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut head = Vec::with_capacity(128);
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_PREAMBLE_RESPONSE {
            return Err(ProxyError::Flex("tunnel response head too large".into()));
        }
        head.push(stream.read_u8().await?);
    }

    let head = String::from_utf8_lossy(&head);
    let status_line = head.lines().next().unwrap_or_default();
    let mut fields = status_line.split_whitespace();
    let version = fields.next().unwrap_or_default();
    let code = fields.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") || code != "200" {
        return Err(ProxyError::Flex(format!(
            "tunnel refused CONNECT {}: {}",
            authority, status_line
        )));
    }
    Ok(())
}

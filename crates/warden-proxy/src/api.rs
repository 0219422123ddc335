//! Client for the remote policy service.
//!
//! The proxy never evaluates rules itself. Connection verdicts, request
//! matchers, body filtering and flex routers all come from the policy
//! service over HTTP. [`PolicyApi`] is the seam; [`HttpPolicyApi`] is the
//! reqwest implementation.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use hyper::body::Bytes;
use reqwest::header::{
    HeaderMap, HeaderValue, ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING,
};
use reqwest::{Method, StatusCode, Url};
use serde::Serialize;
use tracing::debug;

use warden_core::config::ApiConfig;
use warden_core::{CheckVerdict, FilterDecision, FlexRouter, MatchersResponse};

use crate::error::ApiError;

/// Header carrying the client address on every call.
pub const FORWARDED_FOR: &str = "X-Forwarded-For";

/// Response header the filter service sets to stop filtering a flow.
pub const FILTER_PASSTHRU_HEADER: &str = "X-Warden-Passthru";

/// Request header carrying the rewritten CSP on the first chunk.
pub const CSP_HEADER: &str = "Content-Security-Policy";

/// Body of a connection check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnCheckRequest {
    pub server_addr: String,
    pub fqdns: Vec<String>,
    pub client_addr: String,
}

/// Body of a matchers lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchersRequest {
    pub request_id: String,
    pub fqdn: String,
    pub uri: String,
    pub user_agent: String,
    pub referer: String,
    pub client_addr: String,
    pub server_addr: String,
}

/// Parameters sent alongside one filter chunk.
///
/// Type, encoding, length and CSP travel only with the first chunk of a flow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterParams {
    pub content_type: Option<String>,
    pub encoding: Option<String>,
    pub length: Option<u64>,
    pub csp: Option<String>,
    pub last: bool,
}

impl FilterParams {
    /// Params for the terminal empty chunk.
    pub fn last() -> Self {
        Self {
            last: true,
            ..Self::default()
        }
    }

    fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(content_type) = &self.content_type {
            pairs.push(("type", content_type.clone()));
            if let Some(encoding) = &self.encoding {
                pairs.push(("encoding", encoding.clone()));
            }
            if let Some(length) = self.length {
                pairs.push(("length", length.to_string()));
            }
        }
        if self.last {
            pairs.push(("last", "true".to_string()));
        }
        pairs
    }
}

/// One chunk of a response body on its way to the filter service.
#[derive(Debug, Clone)]
pub struct FilterChunk {
    pub request_id: String,
    pub client: String,
    pub data: Bytes,
    pub params: FilterParams,
}

/// What the filter service did with a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterOutcome {
    /// Replacement bytes for the chunk.
    Filtered(Bytes),
    /// The service asked the proxy to stop filtering this flow.
    StopFiltering,
}

/// The service's answer to a relayed special-path request.
pub struct SpecialResponse {
    pub status: StatusCode,
    /// Response headers without Content-Length or Transfer-Encoding.
    pub headers: HeaderMap,
    pub body: BoxStream<'static, Result<Bytes, ApiError>>,
}

impl std::fmt::Debug for SpecialResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpecialResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Remote policy service.
#[async_trait]
pub trait PolicyApi: Send + Sync {
    /// Asks whether a connection should pass through, be blocked or be
    /// intercepted.
    async fn check_connection(&self, req: &ConnCheckRequest) -> Result<CheckVerdict, ApiError>;

    /// Fetches the filter decision and candidate matchers for a request.
    async fn matchers(&self, req: &MatchersRequest) -> Result<MatchersResponse, ApiError>;

    /// Sends one body chunk through the filter service.
    async fn apply_filter(&self, chunk: FilterChunk) -> Result<FilterOutcome, ApiError>;

    /// Looks up the flex router serving `host` for `client`.
    async fn flex_router(&self, client: &str, host: &str) -> Result<Option<FlexRouter>, ApiError>;

    /// Relays a request under the special path prefix to `rest`, relative
    /// to the service base URL. Any status the service answers is returned.
    async fn relay_special(
        &self,
        client: &str,
        method: Method,
        rest: &str,
        body: Bytes,
    ) -> Result<SpecialResponse, ApiError>;
}

/// [`PolicyApi`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpPolicyApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPolicyApi {
    /// Builds a client for the service described by `config`.
    pub fn new(config: &ApiConfig) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .no_proxy()
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Returns the base URL calls are made against.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl PolicyApi for HttpPolicyApi {
    async fn check_connection(&self, req: &ConnCheckRequest) -> Result<CheckVerdict, ApiError> {
        let response = self
            .client
            .post(self.url("/filter/check"))
            .header(FORWARDED_FOR, &req.client_addr)
            .json(req)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status(status.as_u16()));
        }

        let text = response.text().await?;
        debug!("Connection check for {} -> {}", req.server_addr, text.trim());
        Ok(CheckVerdict::parse(&text))
    }

    async fn matchers(&self, req: &MatchersRequest) -> Result<MatchersResponse, ApiError> {
        let response = self
            .client
            .post(self.url(&format!("/filter/matchers/{}", req.request_id)))
            .header(FORWARDED_FOR, &req.client_addr)
            .json(req)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::FORBIDDEN {
            // The service refuses blocked clients; treat that as a 404 abort.
            return Ok(MatchersResponse {
                decision: FilterDecision::AbortNotFound,
                matchers: Vec::new(),
            });
        }
        if !status.is_success() {
            return Err(ApiError::Status(status.as_u16()));
        }

        response
            .json::<MatchersResponse>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }

    async fn apply_filter(&self, chunk: FilterChunk) -> Result<FilterOutcome, ApiError> {
        let mut url = Url::parse(&self.url(&format!("/filter/apply/{}", chunk.request_id)))
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        let pairs = chunk.params.query_pairs();
        if !pairs.is_empty() {
            url.query_pairs_mut().extend_pairs(pairs);
        }

        let mut request = self
            .client
            .post(url)
            .header(FORWARDED_FOR, &chunk.client)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
        if let Some(csp) = &chunk.params.csp {
            request = request.header(CSP_HEADER, csp);
        }

        let response = request.body(chunk.data).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status(status.as_u16()));
        }

        if response.headers().contains_key(FILTER_PASSTHRU_HEADER) {
            return Ok(FilterOutcome::StopFiltering);
        }

        Ok(FilterOutcome::Filtered(response.bytes().await?))
    }

    async fn flex_router(&self, client: &str, host: &str) -> Result<Option<FlexRouter>, ApiError> {
        let response = self
            .client
            .get(self.url(&format!("/filter/flexRouters/{}", host)))
            .header(FORWARDED_FOR, client)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ApiError::Status(status.as_u16()));
        }

        let router = response
            .json::<FlexRouter>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        Ok(Some(router))
    }

    async fn relay_special(
        &self,
        client: &str,
        method: Method,
        rest: &str,
        body: Bytes,
    ) -> Result<SpecialResponse, ApiError> {
        let url = format!("{}/{}", self.base_url, rest.trim_start_matches('/'));
        let mut request = self
            .client
            .request(method.clone(), &url)
            .header(FORWARDED_FOR, client)
            .header(ACCEPT, HeaderValue::from_static("application/json"))
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if !body.is_empty() {
            request = request.body(body);
        }

        let response = request.send().await?;
        let status = response.status();
        debug!("Special {} {} answered {}", method, url, status);

        let mut headers = response.headers().clone();
        headers.remove(CONTENT_LENGTH);
        headers.remove(TRANSFER_ENCODING);
        Ok(SpecialResponse {
            status,
            headers,
            body: response.bytes_stream().map(|r| r.map_err(ApiError::from)).boxed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use warden_core::MatcherRule;
    use wiremock::matchers::{body_bytes, body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn api_for(server: &MockServer) -> HttpPolicyApi {
        let config = ApiConfig {
            base_url: format!("{}/api/", server.uri()),
            timeout_secs: 2,
        };
        HttpPolicyApi::new(&config).unwrap()
    }

    fn chunk(data: &'static [u8], params: FilterParams) -> FilterChunk {
        FilterChunk {
            request_id: "example.com.1".to_string(),
            client: "10.0.0.2".to_string(),
            data: Bytes::from_static(data),
            params,
        }
    }

    #[tokio::test]
    async fn check_connection_posts_addresses() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/filter/check"))
            .and(header(FORWARDED_FOR, "10.0.0.2"))
            .and(body_json(json!({
                "serverAddr": "93.184.216.34",
                "fqdns": ["example.com"],
                "clientAddr": "10.0.0.2",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_string("\"passthru\""))
            .expect(1)
            .mount(&server)
            .await;

        let api = api_for(&server).await;
        let verdict = api
            .check_connection(&ConnCheckRequest {
                server_addr: "93.184.216.34".into(),
                fqdns: vec!["example.com".into()],
                client_addr: "10.0.0.2".into(),
            })
            .await
            .unwrap();

        assert_eq!(verdict, CheckVerdict::Passthru);
    }

    #[tokio::test]
    async fn check_connection_surfaces_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/filter/check"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let api = api_for(&server).await;
        let err = api
            .check_connection(&ConnCheckRequest {
                server_addr: "1.2.3.4".into(),
                fqdns: vec![],
                client_addr: "10.0.0.2".into(),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::Status(500)));
    }

    fn matchers_request() -> MatchersRequest {
        MatchersRequest {
            request_id: "example.com.1".into(),
            fqdn: "example.com".into(),
            uri: "/index.html".into(),
            user_agent: "curl/8".into(),
            referer: "NONE".into(),
            client_addr: "10.0.0.2".into(),
            server_addr: "93.184.216.34".into(),
        }
    }

    #[tokio::test]
    async fn matchers_decode_rules() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/filter/matchers/example.com.1"))
            .and(header(FORWARDED_FOR, "10.0.0.2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "decision": "match",
                "matchers": [{"uuid": "m1", "rule": "ads", "urlRegex": "/index.*"}],
            })))
            .mount(&server)
            .await;

        let api = api_for(&server).await;
        let response = api.matchers(&matchers_request()).await.unwrap();

        assert_eq!(response.decision, FilterDecision::Match);
        assert_eq!(response.matchers, vec![MatcherRule::new("m1", "ads", "/index.*")]);
    }

    #[tokio::test]
    async fn matchers_forbidden_becomes_not_found_abort() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/filter/matchers/example.com.1"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let api = api_for(&server).await;
        let response = api.matchers(&matchers_request()).await.unwrap();

        assert_eq!(response.decision, FilterDecision::AbortNotFound);
        assert!(response.matchers.is_empty());
    }

    #[tokio::test]
    async fn matchers_server_error_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let api = api_for(&server).await;
        assert!(matches!(
            api.matchers(&matchers_request()).await,
            Err(ApiError::Status(502))
        ));
    }

    #[tokio::test]
    async fn first_chunk_carries_type_and_csp() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/filter/apply/example.com.1"))
            .and(query_param("type", "text/html"))
            .and(query_param("encoding", "gzip"))
            .and(query_param("length", "5"))
            .and(header("content-type", "application/octet-stream"))
            .and(header(CSP_HEADER, "script-src 'nonce-abc'"))
            .and(body_bytes(b"hello".to_vec()))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"HELLO".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let api = api_for(&server).await;
        let outcome = api
            .apply_filter(chunk(
                b"hello",
                FilterParams {
                    content_type: Some("text/html".into()),
                    encoding: Some("gzip".into()),
                    length: Some(5),
                    csp: Some("script-src 'nonce-abc'".into()),
                    last: false,
                },
            ))
            .await
            .unwrap();

        assert_eq!(outcome, FilterOutcome::Filtered(Bytes::from_static(b"HELLO")));
    }

    #[tokio::test]
    async fn last_chunk_sets_last_flag() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/filter/apply/example.com.1"))
            .and(query_param("last", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"<tail>".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let api = api_for(&server).await;
        let outcome = api.apply_filter(chunk(b"", FilterParams::last())).await.unwrap();

        assert_eq!(outcome, FilterOutcome::Filtered(Bytes::from_static(b"<tail>")));
    }

    #[tokio::test]
    async fn passthru_header_stops_filtering() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/filter/apply/example.com.1"))
            .respond_with(ResponseTemplate::new(200).insert_header(FILTER_PASSTHRU_HEADER, "true"))
            .mount(&server)
            .await;

        let api = api_for(&server).await;
        let outcome = api
            .apply_filter(chunk(b"data", FilterParams::default()))
            .await
            .unwrap();

        assert_eq!(outcome, FilterOutcome::StopFiltering);
    }

    #[tokio::test]
    async fn flex_router_lookup() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/filter/flexRouters/example.com"))
            .and(header(FORWARDED_FOR, "10.0.0.2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "proxyUrl": "http://127.0.0.1:3128",
                "port": 3128,
                "auth": "Basic dTpw",
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/filter/flexRouters/unknown.com"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let api = api_for(&server).await;
        let router = api.flex_router("10.0.0.2", "example.com").await.unwrap().unwrap();
        assert!(router.is_available());
        assert_eq!(router.tcp_port(), Some(3128));

        assert!(api.flex_router("10.0.0.2", "unknown.com").await.unwrap().is_none());
    }

    async fn collect_body(response: SpecialResponse) -> Vec<u8> {
        let chunks: Vec<Result<Bytes, ApiError>> = response.body.collect().await;
        chunks.into_iter().flat_map(|c| c.unwrap().to_vec()).collect()
    }

    #[tokio::test]
    async fn special_get_is_relayed_under_base_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/devices/status"))
            .and(query_param("verbose", "1"))
            .and(header(FORWARDED_FOR, "10.0.0.2"))
            .and(header("accept", "application/json"))
            .and(header("content-type", "application/json"))
            .respond_with(
                ResponseTemplate::new(202)
                    .insert_header("x-device", "phone")
                    .set_body_string("{\"ok\":true}"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let api = api_for(&server).await;
        let response = api
            .relay_special("10.0.0.2", Method::GET, "devices/status?verbose=1", Bytes::new())
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::ACCEPTED);
        assert_eq!(response.headers.get("x-device").unwrap(), "phone");
        assert!(response.headers.get(CONTENT_LENGTH).is_none());
        assert_eq!(collect_body(response).await, b"{\"ok\":true}");
    }

    #[tokio::test]
    async fn special_post_carries_body_and_keeps_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/login"))
            .and(body_json(json!({"name": "admin"})))
            .respond_with(ResponseTemplate::new(401).set_body_string("denied"))
            .expect(1)
            .mount(&server)
            .await;

        let api = api_for(&server).await;
        let response = api
            .relay_special(
                "10.0.0.2",
                Method::POST,
                "auth/login",
                Bytes::from_static(br#"{"name":"admin"}"#),
            )
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        assert_eq!(collect_body(response).await, b"denied");
    }

    #[test]
    fn query_pairs_follow_params() {
        assert!(FilterParams::default().query_pairs().is_empty());

        let params = FilterParams {
            content_type: Some("text/html".into()),
            encoding: None,
            length: Some(10),
            csp: None,
            last: false,
        };
        assert_eq!(
            params.query_pairs(),
            vec![("type", "text/html".to_string()), ("length", "10".to_string())]
        );
    }
}

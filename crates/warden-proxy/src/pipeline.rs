//! Streaming filter pipeline.
//!
//! Response bodies of flows with matchers are cut into chunks and sent
//! through the remote filter service, which may rewrite them. The body is
//! never held in full: chunks are relayed as soon as the service returns
//! them.
//!
//! ```text
//! upstream body ─▶ ChunkRelay ─▶ POST /filter/apply ─▶ client
//!                   │ buffer to chunk_size
//!                   │ first chunk: type, encoding, length, CSP
//!                   └ end (or declared length reached): one empty last=true call
//! ```

use std::fmt::Display;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use hyper::body::Bytes;
use hyper::header::{
    HeaderMap, HeaderValue, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_SECURITY_POLICY,
    CONTENT_TYPE,
};
use hyper::StatusCode;
use regex::Regex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use warden_core::config::WardenConfig;
use warden_core::csp::{request_nonce, rewrite_csp};
use warden_core::{ActivityEvent, ActivityLog, MatcherRule, Reason, Stage};
use warden_storage::PolicyView;

use crate::api::{FilterChunk, FilterOutcome, FilterParams, PolicyApi};
use crate::flow::FlowContext;

/// Chunks buffered between the relay task and the client.
const RELAY_CHANNEL_DEPTH: usize = 4;

/// True if any matcher's content-type pattern matches `content_type` at its
/// start. Matchers without a pattern use `default_pattern`.
pub fn content_type_matches(
    matchers: &[MatcherRule],
    content_type: &str,
    default_pattern: &str,
) -> bool {
    matchers.iter().any(|m| {
        let pattern = m.content_type_regex.as_deref().unwrap_or(default_pattern);
        match Regex::new(&format!("^(?:{})", pattern)) {
            Ok(re) => re.is_match(content_type),
            Err(e) => {
                warn!("Rule {} has an invalid content type pattern: {}", m.rule, e);
                false
            }
        }
    })
}

fn header_str(headers: &HeaderMap, name: &hyper::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
}

#[derive(Clone)]
pub struct FilterPipeline {
    config: Arc<WardenConfig>,
    policy: PolicyView,
    api: Arc<dyn PolicyApi>,
    activity: Arc<dyn ActivityLog>,
}

impl FilterPipeline {
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

    /// Decides whether a response is filtered.
    ///
    /// When it is, the headers are rewritten in place (Content-Length
    /// dropped, CSP opened to the request nonce), the flow is marked filtered
    /// and a relay for the body is returned. Otherwise the response is left
    /// untouched.
    pub fn prepare(
        &self,
        flow: &mut FlowContext,
        status: StatusCode,
        headers: &mut HeaderMap,
    ) -> Option<ChunkRelay> {
        if flow.passthru || !flow.has_matchers() {
            return None;
        }
        if flow.is_filtered() {
            warn!("{} is already being filtered", flow.url);
            return None;
        }
        if !status.is_success()
            || matches!(status, StatusCode::NO_CONTENT | StatusCode::RESET_CONTENT)
        {
            debug!("{} answered {}, returning as-is", flow.url, status);
            return None;
        }
        if flow.method.eq_ignore_ascii_case("HEAD") {
            debug!("{} is a HEAD request, returning as-is", flow.url);
            return None;
        }
        if headers
            .get(CONTENT_LENGTH)
            .is_some_and(|v| v.as_bytes() == b"0")
        {
            debug!("{} has an empty body, returning as-is", flow.url);
            return None;
        }
        let Some(content_type) = header_str(headers, &CONTENT_TYPE) else {
            warn!("{} has no content type, returning as-is", flow.url);
            return None;
        };
        if !content_type_matches(
            &flow.matchers,
            &content_type,
            &self.config.filter.default_content_type,
        ) {
            debug!("No matcher for content type {} on {}", content_type, flow.url);
            return None;
        }

        let bypass_ttl = self.config.filter.bypass_ttl();
        if self
            .policy
            .refresh_filter_bypass(&flow.method, &flow.user_agent, &flow.url, bypass_ttl)
        {
            debug!("Filter bypass cached for {}", flow.url);
            self.log(flow, "filter_bypass", Reason::FilterBypass);
            return None;
        }

        let request_id = flow.request_id.clone()?;
        if !flow.mark_filtered() {
            return None;
        }

        let declared = headers
            .remove(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok().and_then(|s| s.trim().parse::<u64>().ok()));
        flow.content_length = declared;

        let csp = header_str(headers, &CONTENT_SECURITY_POLICY)
            .map(|csp| rewrite_csp(&csp, &request_nonce(&request_id)));
        if let Some(csp) = &csp {
            match HeaderValue::from_str(csp) {
                Ok(value) => {
                    headers.insert(CONTENT_SECURITY_POLICY, value);
                }
                Err(e) => warn!("Rewritten CSP for {} is not a valid header: {}", flow.url, e),
            }
        }

        info!("Filtering {} as {} ({})", flow.url, request_id, content_type);
        self.log(flow, "filter", Reason::FilterApplied);

        Some(ChunkRelay {
            api: self.api.clone(),
            policy: self.policy.clone(),
            activity: self.activity.clone(),
            request_id,
            client: flow.client.clone(),
            method: flow.method.clone(),
            user_agent: flow.user_agent.clone(),
            url: flow.url.clone(),
            first: FilterParams {
                content_type: Some(content_type),
                encoding: header_str(headers, &CONTENT_ENCODING),
                length: declared,
                csp,
                last: false,
            },
            chunk_size: self.config.filter.chunk_size.max(1),
            bypass_ttl,
            declared_length: declared,
            buffer: Vec::new(),
            bytes_seen: 0,
            chunks_sent: 0,
            state: RelayState::Filtering,
        })
    }

    fn log(&self, flow: &FlowContext, action: &str, reason: Reason) {
        self.activity.record(ActivityEvent::new(
            Stage::Filter,
            &flow.client,
            &flow.url,
            action,
            reason,
        ));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayState {
    Filtering,
    /// The service asked to stop; the rest is relayed raw.
    Stopped,
    /// The terminal call was made; anything after it is relayed raw.
    Finished,
}

/// Chunks one response body through the filter service.
///
/// Drive it with [`ChunkRelay::process`]: `Some(data)` for each upstream
/// chunk, then `None` once at end of stream. Each call returns the bytes to
/// send to the client next, which may be empty while buffering.
pub struct ChunkRelay {
    api: Arc<dyn PolicyApi>,
    policy: PolicyView,
    activity: Arc<dyn ActivityLog>,
    request_id: String,
    client: String,
    method: String,
    user_agent: String,
    url: String,
    first: FilterParams,
    chunk_size: usize,
    bypass_ttl: std::time::Duration,
    declared_length: Option<u64>,
    buffer: Vec<u8>,
    bytes_seen: u64,
    chunks_sent: u64,
    state: RelayState,
}

impl ChunkRelay {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub async fn process(&mut self, chunk: Option<Bytes>) -> Option<Bytes> {
        if self.state != RelayState::Filtering {
            return chunk;
        }

        match chunk {
            Some(data) => {
                self.bytes_seen += data.len() as u64;
                self.buffer.extend_from_slice(&data);

                let complete = self
                    .declared_length
                    .is_some_and(|len| self.bytes_seen >= len);
                if complete {
                    Some(self.finish().await)
                } else if self.buffer.len() >= self.chunk_size {
                    Some(self.flush().await)
                } else {
                    Some(Bytes::new())
                }
            }
            None => Some(self.finish().await),
        }
    }

    /// Flushes what is buffered, then makes the terminal call.
    async fn finish(&mut self) -> Bytes {
        let head = if self.buffer.is_empty() {
            Bytes::new()
        } else {
            self.flush().await
        };
        if self.state != RelayState::Filtering {
            return head;
        }

        let tail = self.send(Bytes::new(), FilterParams::last()).await;
        if self.state == RelayState::Filtering {
            self.state = RelayState::Finished;
        }
        debug!(
            "{}: finished after {} byte(s) in {} chunk(s)",
            self.request_id, self.bytes_seen, self.chunks_sent
        );

        if head.is_empty() {
            tail
        } else if tail.is_empty() {
            head
        } else {
            let mut joined = Vec::with_capacity(head.len() + tail.len());
            joined.extend_from_slice(&head);
            joined.extend_from_slice(&tail);
            Bytes::from(joined)
        }
    }

    async fn flush(&mut self) -> Bytes {
        let data = Bytes::from(std::mem::take(&mut self.buffer));
        let params = if self.chunks_sent == 0 {
            self.first.clone()
        } else {
            FilterParams::default()
        };
        self.send(data, params).await
    }

    async fn send(&mut self, data: Bytes, params: FilterParams) -> Bytes {
        let last = params.last;

        if self
            .policy
            .refresh_filter_bypass(&self.method, &self.user_agent, &self.url, self.bypass_ttl)
        {
            debug!("{}: bypass cached, relaying raw", self.request_id);
            self.state = RelayState::Stopped;
            return data;
        }

        let chunk = FilterChunk {
            request_id: self.request_id.clone(),
            client: self.client.clone(),
            data: data.clone(),
            params,
        };
        if !last {
            self.chunks_sent += 1;
        }

        match self.api.apply_filter(chunk).await {
            Ok(FilterOutcome::Filtered(filtered)) => filtered,
            Ok(FilterOutcome::StopFiltering) => {
                info!("{}: filter service stopped filtering {}", self.request_id, self.url);
                self.policy
                    .set_filter_bypass(&self.method, &self.user_agent, &self.url, self.bypass_ttl);
                self.state = RelayState::Stopped;
                self.activity.record(ActivityEvent::new(
                    Stage::Filter,
                    &self.client,
                    &self.url,
                    "filter_stop",
                    Reason::FilterStopped,
                ));
                data
            }
            Err(e) => {
                warn!("{}: filter call failed, dropping chunk: {}", self.request_id, e);
                self.activity.record(ActivityEvent::new(
                    Stage::Filter,
                    &self.client,
                    &self.url,
                    "filter_error",
                    Reason::FilterError,
                ));
                Bytes::new()
            }
        }
    }
}

/// Spawns a task that relays `input` to the returned stream, through `relay`
/// when one is given.
///
/// Empty outputs are skipped. An input error ends the stream early. Dropping
/// the returned stream stops the task at its next send.
pub fn spawn_relay<S, E, O>(relay: Option<ChunkRelay>, input: S) -> ReceiverStream<Result<Bytes, O>>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
    O: Send + 'static,
{
    let (tx, rx) = mpsc::channel(RELAY_CHANNEL_DEPTH);

    tokio::spawn(async move {
        let mut relay = relay;
        let mut input = Box::pin(input);

        while let Some(item) = input.next().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(e) => {
                    warn!("Upstream body failed, truncating response: {}", e);
                    return;
                }
            };
            let out = match relay.as_mut() {
                Some(relay) => relay.process(Some(chunk)).await,
                None => Some(chunk),
            };
            if let Some(out) = out.filter(|b| !b.is_empty()) {
                if tx.send(Ok(out)).await.is_err() {
                    debug!("Client went away, abandoning relay");
                    return;
                }
            }
        }

        if let Some(relay) = relay.as_mut() {
            if let Some(out) = relay.process(None).await.filter(|b| !b.is_empty()) {
                let _ = tx.send(Ok(out)).await;
            }
        }
    });

    ReceiverStream::new(rx)
}

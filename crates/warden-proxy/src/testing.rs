//! In-process policy service for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use hyper::body::Bytes;
use hyper::header::HeaderMap;
use hyper::{Method, StatusCode};
use parking_lot::Mutex;
use warden_core::config::WardenConfig;
use warden_core::{
    CheckVerdict, FilterDecision, FlexRouter, MatcherRule, MatchersResponse, MemoryActivityLog,
};
use warden_storage::{MemoryStore, PolicyView};

use crate::api::{
    ConnCheckRequest, FilterChunk, FilterOutcome, MatchersRequest, PolicyApi, SpecialResponse,
};
use crate::error::ApiError;

type FilterFn = dyn Fn(&FilterChunk) -> Result<FilterOutcome, ApiError> + Send + Sync;

/// Scriptable [`PolicyApi`] that records every call.
pub struct FakePolicyApi {
    verdict: Mutex<Result<CheckVerdict, u16>>,
    matchers: Mutex<Result<MatchersResponse, u16>>,
    filter: Mutex<Arc<FilterFn>>,
    flex: Mutex<Option<FlexRouter>>,
    special: Mutex<Result<(u16, String), u16>>,
    pub check_calls: AtomicUsize,
    pub matchers_calls: AtomicUsize,
    pub flex_calls: AtomicUsize,
    pub chunks: Mutex<Vec<FilterChunk>>,
    pub last_matchers_request: Mutex<Option<MatchersRequest>>,
    pub special_requests: Mutex<Vec<(Method, String, Bytes)>>,
}

impl FakePolicyApi {
    /// Intercepts everything, matches nothing and echoes filter chunks.
    pub fn new() -> Self {
        Self {
            verdict: Mutex::new(Ok(CheckVerdict::Other("intercept".into()))),
            matchers: Mutex::new(Ok(MatchersResponse {
                decision: FilterDecision::Match,
                matchers: Vec::new(),
            })),
            filter: Mutex::new(Arc::new(|chunk: &FilterChunk| {
                Ok(FilterOutcome::Filtered(chunk.data.clone()))
            })),
            flex: Mutex::new(None),
            special: Mutex::new(Err(404)),
            check_calls: AtomicUsize::new(0),
            matchers_calls: AtomicUsize::new(0),
            flex_calls: AtomicUsize::new(0),
            chunks: Mutex::new(Vec::new()),
            last_matchers_request: Mutex::new(None),
            special_requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_verdict(self, verdict: CheckVerdict) -> Self {
        *self.verdict.lock() = Ok(verdict);
        self
    }

    pub fn with_check_status(self, status: u16) -> Self {
        *self.verdict.lock() = Err(status);
        self
    }

    pub fn with_matchers(self, decision: FilterDecision, matchers: Vec<MatcherRule>) -> Self {
        *self.matchers.lock() = Ok(MatchersResponse { decision, matchers });
        self
    }

    pub fn with_matchers_status(self, status: u16) -> Self {
        *self.matchers.lock() = Err(status);
        self
    }

    pub fn with_filter<F>(self, filter: F) -> Self
    where
        F: Fn(&FilterChunk) -> Result<FilterOutcome, ApiError> + Send + Sync + 'static,
    {
        *self.filter.lock() = Arc::new(filter);
        self
    }

    pub fn with_flex_router(self, router: FlexRouter) -> Self {
        *self.flex.lock() = Some(router);
        self
    }

    /// Answers special-path requests with `status` and `body`.
    pub fn with_special(self, status: u16, body: &str) -> Self {
        *self.special.lock() = Ok((status, body.to_string()));
        self
    }

    pub fn checks(&self) -> usize {
        self.check_calls.load(Ordering::SeqCst)
    }

    pub fn recorded_chunks(&self) -> Vec<FilterChunk> {
        self.chunks.lock().clone()
    }

    pub fn last_calls(&self) -> usize {
        self.chunks.lock().iter().filter(|c| c.params.last).count()
    }
}

#[async_trait]
impl PolicyApi for FakePolicyApi {
    async fn check_connection(&self, _req: &ConnCheckRequest) -> Result<CheckVerdict, ApiError> {
        self.check_calls.fetch_add(1, Ordering::SeqCst);
        self.verdict.lock().clone().map_err(ApiError::Status)
    }

    async fn matchers(&self, req: &MatchersRequest) -> Result<MatchersResponse, ApiError> {
        self.matchers_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_matchers_request.lock() = Some(req.clone());
        self.matchers.lock().clone().map_err(ApiError::Status)
    }

    async fn apply_filter(&self, chunk: FilterChunk) -> Result<FilterOutcome, ApiError> {
        let filter = self.filter.lock().clone();
        let outcome = filter(&chunk);
        self.chunks.lock().push(chunk);
        outcome
    }

    async fn flex_router(&self, _client: &str, _host: &str) -> Result<Option<FlexRouter>, ApiError> {
        self.flex_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.flex.lock().clone())
    }

    async fn relay_special(
        &self,
        _client: &str,
        method: Method,
        rest: &str,
        body: Bytes,
    ) -> Result<SpecialResponse, ApiError> {
        self.special_requests.lock().push((method, rest.to_string(), body));
        let (status, body) = self.special.lock().clone().map_err(ApiError::Status)?;
        let status = StatusCode::from_u16(status).map_err(|e| ApiError::Decode(e.to_string()))?;
        let chunk: Result<Bytes, ApiError> = Ok(Bytes::from(body));
        Ok(SpecialResponse {
            status,
            headers: HeaderMap::new(),
            body: futures::stream::iter([chunk]).boxed(),
        })
    }
}

/// Shared fixtures for component tests.
pub struct Fixture {
    pub config: Arc<WardenConfig>,
    pub store: Arc<MemoryStore>,
    pub policy: PolicyView,
    pub api: Arc<FakePolicyApi>,
    pub activity: Arc<MemoryActivityLog>,
}

impl Fixture {
    pub fn new(api: FakePolicyApi) -> Self {
        Self::with_config(WardenConfig::default(), api)
    }

    pub fn with_config(config: WardenConfig, api: FakePolicyApi) -> Self {
        let store = Arc::new(MemoryStore::new());
        let policy = PolicyView::new(store.clone(), config.default_security_level);
        Self {
            config: Arc::new(config),
            store,
            policy,
            api: Arc::new(api),
            activity: Arc::new(MemoryActivityLog::new()),
        }
    }
}

/// Bytes helper for assertions.
pub fn bytes(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

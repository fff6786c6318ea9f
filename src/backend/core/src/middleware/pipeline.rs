//! Request defense pipeline.
//!
//! Every request that is not on an exempt path runs these stages in order and
//! stops at the first rejection:
//!
//! 1. Size: declared `Content-Length` against the content type's limit
//! 2. Origin: `Origin`/`Referer` against the expected host, for protected methods
//! 3. Rate limit: local and/or distributed tier, per the route's traffic class
//! 4. Sanitize: JSON and form body screening, once the body has been buffered
//!
//! Rate limit counters are charged on attempt. A request that is cancelled or
//! rejected by a later stage still counts.

use axum::{
    body::Body,
    extract::{ConnectInfo, Request},
    http::{header, HeaderMap, HeaderValue, Method},
    response::{IntoResponse, Response},
};
use futures::future::BoxFuture;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use std::{
    net::SocketAddr,
    sync::Arc,
    task::{Context, Poll},
    time::Instant,
};
use tower::{Layer, Service};
use tracing::{debug, warn};
use uuid::Uuid;

use super::client_key::ClientKey;
use super::csrf::OriginValidator;
use super::input_sanitizer::{BodyFormat, InputSanitizer};
use super::rate_limit::{
    DistributedRateLimiter, LocalRateLimiter, PolicyTable, RateLimitDecision, RateLimitTier,
    TrafficClass,
};
use super::request_size::{normalize_content_type, PayloadCheck, PayloadValidator};
use super::verdict::{Rejection, Verdict};
use crate::config::DefenseConfig;
use crate::telemetry::SensitiveFieldRedactor;

// ═══════════════════════════════════════════════════════════════════════════════
// Routes
// ═══════════════════════════════════════════════════════════════════════════════

/// Maps a path prefix to a traffic class and the tiers that enforce it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    pub path_prefix: String,

    pub class: TrafficClass,

    /// Enforce in the local limiter
    #[serde(default = "default_true")]
    pub local: bool,

    /// Enforce in the shared store. Falls back to local when no store is configured.
    #[serde(default)]
    pub distributed: bool,
}

impl RouteRule {
    pub fn new(path_prefix: impl Into<String>, class: TrafficClass, local: bool, distributed: bool) -> Self {
        Self {
            path_prefix: path_prefix.into(),
            class,
            local,
            distributed,
        }
    }

    /// Segment-aware prefix match: `/api` covers `/api` and `/api/x`, not `/apix`.
    pub fn matches(&self, path: &str) -> bool {
        path_has_prefix(path, &self.path_prefix)
    }
}

pub fn default_routes() -> Vec<RouteRule> {
    vec![
        RouteRule::new("/api/auth", TrafficClass::Auth, true, true),
        RouteRule::new("/api/upload", TrafficClass::Upload, true, true),
        RouteRule::new("/api/menu", TrafficClass::PublicMenu, false, true),
        RouteRule::new("/api", TrafficClass::Api, true, false),
    ]
}

fn default_true() -> bool {
    true
}

fn path_has_prefix(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
        None => false,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Request Metadata
// ═══════════════════════════════════════════════════════════════════════════════

/// Request attributes the pipeline reads, captured before the body is touched.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub method: Method,
    pub path: String,
    pub host: Option<String>,
    pub origin: Option<String>,
    pub referer: Option<String>,
    pub content_length: Option<String>,
    pub content_type: Option<String>,
    pub client: ClientKey,
    pub request_id: String,
}

impl RequestMeta {
    pub fn from_request<B>(req: &Request<B>, ua_len: usize) -> Self {
        let peer = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Self::from_parts(req.method().clone(), req.uri().path(), req.headers(), peer, ua_len)
    }

    pub fn from_parts(
        method: Method,
        path: &str,
        headers: &HeaderMap,
        peer: Option<SocketAddr>,
        ua_len: usize,
    ) -> Self {
        let value_of = |name: header::HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        };

        let request_id = headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .filter(|id| !id.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Self {
            method,
            path: path.to_string(),
            host: value_of(header::HOST),
            origin: value_of(header::ORIGIN),
            referer: value_of(header::REFERER),
            content_length: value_of(header::CONTENT_LENGTH),
            content_type: value_of(header::CONTENT_TYPE),
            client: ClientKey::derive(headers, peer, ua_len),
            request_id,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Pipeline
// ═══════════════════════════════════════════════════════════════════════════════

/// Result of stages 1-3 for an admitted request.
#[derive(Debug, Clone)]
pub struct Admission {
    pub payload: PayloadCheck,
    pub class: Option<TrafficClass>,
    pub decisions: Vec<(RateLimitTier, RateLimitDecision)>,
}

impl Admission {
    /// Decision with the fewest remaining requests, preferring ones that were
    /// actually checked over degraded ones.
    pub fn most_restrictive(&self) -> Option<&RateLimitDecision> {
        self.decisions
            .iter()
            .map(|(_, d)| d)
            .min_by_key(|d| (d.is_degraded(), d.remaining))
    }

    pub fn verdict(&self) -> Verdict {
        Verdict::allow()
    }
}

pub struct DefensePipeline {
    payload: PayloadValidator,
    origin: OriginValidator,
    sanitizer: InputSanitizer,
    policies: PolicyTable,
    routes: Vec<RouteRule>,
    exempt_paths: Vec<String>,
    ua_len: usize,
    local: Arc<LocalRateLimiter>,
    distributed: Option<Arc<DistributedRateLimiter>>,
}

impl DefensePipeline {
    pub fn new(
        config: &DefenseConfig,
        local: Arc<LocalRateLimiter>,
        distributed: Option<Arc<DistributedRateLimiter>>,
    ) -> crate::error::Result<Self> {
        config.validate()?;

        Ok(Self {
            payload: PayloadValidator::new(config.payload_limits.clone())?,
            origin: OriginValidator::new(&config.csrf),
            sanitizer: InputSanitizer::new(&config.sanitizer),
            policies: config.policies.clone(),
            routes: config.routes.clone(),
            exempt_paths: config.exempt_paths.clone(),
            ua_len: config.user_agent_fragment_len,
            local,
            distributed,
        })
    }

    pub fn is_exempt(&self, path: &str) -> bool {
        self.exempt_paths.iter().any(|p| path_has_prefix(path, p))
    }

    pub fn route_for(&self, path: &str) -> Option<&RouteRule> {
        self.routes.iter().find(|rule| rule.matches(path))
    }

    pub fn local_limiter(&self) -> &Arc<LocalRateLimiter> {
        &self.local
    }

    pub fn distributed_limiter(&self) -> Option<&Arc<DistributedRateLimiter>> {
        self.distributed.as_ref()
    }

    pub fn user_agent_fragment_len(&self) -> usize {
        self.ua_len
    }

    /// Run size, origin and rate limit stages.
    pub async fn admit(&self, meta: &RequestMeta) -> Result<Admission, Rejection> {
        let payload = self
            .payload
            .validate(meta.content_length.as_deref(), meta.content_type.as_deref())?;

        if self.origin.requires_check(&meta.method)
            && !self.origin.verify(
                meta.origin.as_deref(),
                meta.referer.as_deref(),
                meta.host.as_deref(),
            )
        {
            return Err(Rejection::InvalidOrigin);
        }

        let Some(rule) = self.route_for(&meta.path) else {
            return Ok(Admission {
                payload,
                class: None,
                decisions: Vec::new(),
            });
        };

        let policy = self.policies.get(rule.class);
        let key = meta.client.scoped(&policy.key_prefix);
        let distributed = self.distributed.as_deref().filter(|_| rule.distributed);
        let mut decisions = Vec::with_capacity(2);

        if rule.local || (rule.distributed && distributed.is_none()) {
            let decision = self.local.check(policy, &key);
            if !decision.allowed() {
                return Err(rate_limited(&decision));
            }
            decisions.push((RateLimitTier::Local, decision));
        }

        if let Some(limiter) = distributed {
            let decision = limiter.check(policy, &key).await;
            if !decision.allowed() {
                return Err(rate_limited(&decision));
            }
            decisions.push((RateLimitTier::Distributed, decision));
        }

        Ok(Admission {
            payload,
            class: Some(rule.class),
            decisions,
        })
    }

    /// Format to screen the body as. JSON and urlencoded form bodies of
    /// protected methods are screened; other bodies pass through.
    pub fn body_format(&self, meta: &RequestMeta) -> Option<BodyFormat> {
        if !self.origin.requires_check(&meta.method) {
            return None;
        }
        meta.content_type
            .as_deref()
            .map(normalize_content_type)
            .and_then(|ct| BodyFormat::from_content_type(&ct))
    }

    /// Screen a buffered body. Returns the rewritten body if free-text
    /// cleanup changed anything.
    pub fn screen_body(&self, body: &[u8], format: BodyFormat) -> Result<Option<Vec<u8>>, Rejection> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }

        match format {
            BodyFormat::Json => self.screen_json_body(body),
            BodyFormat::Form => self.screen_form_body(body),
        }
    }

    fn screen_json_body(&self, body: &[u8]) -> Result<Option<Vec<u8>>, Rejection> {
        let invalid = |_| Rejection::InvalidBody { format: BodyFormat::Json };
        let mut value: serde_json::Value = serde_json::from_slice(body).map_err(invalid)?;

        if self.sanitizer.screen_json(&mut value)? == 0 {
            return Ok(None);
        }

        serde_json::to_vec(&value).map(Some).map_err(invalid)
    }

    fn screen_form_body(&self, body: &[u8]) -> Result<Option<Vec<u8>>, Rejection> {
        let invalid = Rejection::InvalidBody { format: BodyFormat::Form };
        if std::str::from_utf8(body).is_err() {
            return Err(invalid);
        }
        let mut pairs: Vec<(String, String)> =
            serde_urlencoded::from_bytes(body).map_err(|_| invalid.clone())?;

        if self.sanitizer.screen_form(&mut pairs)? == 0 {
            return Ok(None);
        }

        serde_urlencoded::to_string(&pairs)
            .map(|encoded| Some(encoded.into_bytes()))
            .map_err(|_| invalid)
    }

    /// Rejection for a body that overflowed its cap while buffering.
    pub fn payload_overflow(&self, meta: &RequestMeta) -> Rejection {
        self.payload.overflow(meta.content_type.as_deref())
    }

    fn reject(&self, meta: &RequestMeta, rejection: Rejection, started: Instant) -> Response {
        let stage = rejection.stage().as_str();
        let class = self
            .route_for(&meta.path)
            .map_or("none", |rule| rule.class.as_str());
        let pattern = match &rejection {
            Rejection::DangerousInputDetected { pattern } => Some(*pattern),
            _ => None,
        };
        let referer = meta
            .referer
            .as_deref()
            .map(|r| SensitiveFieldRedactor::global().redact_value(r));

        warn!(
            stage,
            class,
            request_id = %meta.request_id,
            method = %meta.method,
            path = %meta.path,
            client = %meta.client.address(),
            referer = ?referer,
            pattern = ?pattern,
            status = rejection.status().as_u16(),
            "Request rejected"
        );

        counter!("defense_rejections_total", "stage" => stage, "class" => class).increment(1);
        histogram!("defense_pipeline_duration_seconds").record(started.elapsed().as_secs_f64());

        let mut response = rejection.into_response();
        if let Ok(id) = HeaderValue::from_str(&meta.request_id) {
            response.headers_mut().insert("x-request-id", id);
        }
        response
    }
}

impl std::fmt::Debug for DefensePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefensePipeline")
            .field("routes", &self.routes)
            .field("exempt_paths", &self.exempt_paths)
            .field("local", &self.local)
            .field("distributed", &self.distributed)
            .finish()
    }
}

fn rate_limited(decision: &RateLimitDecision) -> Rejection {
    Rejection::RateLimited {
        limit: decision.limit,
        reset_at: decision.reset_at,
        retry_after_secs: decision.retry_after_secs.unwrap_or(1),
    }
}

fn rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert("X-RateLimit-Limit", HeaderValue::from(decision.limit));
    headers.insert("X-RateLimit-Remaining", HeaderValue::from(decision.remaining));
    headers.insert("X-RateLimit-Reset", HeaderValue::from(decision.reset_at.timestamp()));
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tower Layer and Service
// ═══════════════════════════════════════════════════════════════════════════════

/// Tower layer running the defense pipeline in front of the inner service.
#[derive(Clone)]
pub struct DefenseLayer {
    pipeline: Arc<DefensePipeline>,
}

impl DefenseLayer {
    pub fn new(pipeline: Arc<DefensePipeline>) -> Self {
        Self { pipeline }
    }
}

impl<S> Layer<S> for DefenseLayer {
    type Service = DefenseService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        DefenseService {
            inner,
            pipeline: self.pipeline.clone(),
        }
    }
}

#[derive(Clone)]
pub struct DefenseService<S> {
    inner: S,
    pipeline: Arc<DefensePipeline>,
}

impl<S> Service<Request<Body>> for DefenseService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let pipeline = self.pipeline.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            if pipeline.is_exempt(req.uri().path()) {
                return inner.call(req).await;
            }

            let started = Instant::now();
            let meta = RequestMeta::from_request(&req, pipeline.user_agent_fragment_len());

            let admission = match pipeline.admit(&meta).await {
                Ok(admission) => admission,
                Err(rejection) => return Ok(pipeline.reject(&meta, rejection, started)),
            };

            let req = if let Some(format) = pipeline.body_format(&meta) {
                let (mut parts, body) = req.into_parts();
                let limit = usize::try_from(admission.payload.max_bytes).unwrap_or(usize::MAX);

                let bytes = match axum::body::to_bytes(body, limit).await {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        debug!(error = %e, "Failed to buffer request body");
                        let rejection = pipeline.payload_overflow(&meta);
                        return Ok(pipeline.reject(&meta, rejection, started));
                    }
                };

                match pipeline.screen_body(&bytes, format) {
                    Ok(Some(rewritten)) => {
                        parts
                            .headers
                            .insert(header::CONTENT_LENGTH, HeaderValue::from(rewritten.len()));
                        Request::from_parts(parts, Body::from(rewritten))
                    }
                    Ok(None) => Request::from_parts(parts, Body::from(bytes)),
                    Err(rejection) => return Ok(pipeline.reject(&meta, rejection, started)),
                }
            } else {
                req
            };

            histogram!("defense_pipeline_duration_seconds").record(started.elapsed().as_secs_f64());

            let mut response = inner.call(req).await?;
            if let Some(decision) = admission.most_restrictive() {
                rate_limit_headers(response.headers_mut(), decision);
            }
            Ok(response)
        })
    }
}

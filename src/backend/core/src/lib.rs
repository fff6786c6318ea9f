//! # Menu Guard Core
//!
//! Request defense for the digital-menu platform's HTTP API.
//!
//! ## Architecture
//!
//! - **Client key**: derives a per-client identity from forwarding headers and the user agent
//! - **Rate limiting**: local fixed-window counters with a background sweep, plus a
//!   shared Redis tier that fails open
//! - **Origin validation**: CSRF defense by matching `Origin`/`Referer` against the host
//! - **Payload size**: per-content-type limits on the declared body length
//! - **Input sanitizer**: rejects markup and script vectors in JSON and form bodies, cleans free text
//! - **Pipeline**: runs the stages in order as one Tower layer
//! - **Telemetry**: structured logging, OTLP export and Prometheus metrics

pub mod api;
pub mod config;
pub mod error;
pub mod middleware;
pub mod telemetry;

pub use error::{ErrorCode, ErrorDetails, ErrorSeverity, GuardError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::api::{build_router, AppState};
    pub use crate::config::{Config, DefenseConfig};
    pub use crate::error::{ErrorCode, ErrorDetails, ErrorSeverity, GuardError, Result};
    pub use crate::middleware::{
        Admission, ClientKey, CsrfConfig, DefenseLayer, DefensePipeline, DistributedRateLimiter,
        InputSanitizer, LimitOutcome, LocalRateLimiter, MemoryStore, OriginValidator,
        PayloadValidator, PolicyTable, RateLimitDecision, RateLimitPolicy, RateLimitStore,
        RateLimitTier, RedisStore, Rejection, RequestMeta, RouteRule, SanitizationVerdict,
        SanitizeConfig, Stage, TrafficClass, Verdict,
    };
    pub use crate::telemetry::{init_telemetry, MetricsRegistry, TelemetryConfig};
}

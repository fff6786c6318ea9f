//! Request defense middleware for Menu Guard.
pub mod client_key;
pub mod csrf;
pub mod input_sanitizer;
pub mod pipeline;
pub mod rate_limit;
pub mod request_size;
pub mod verdict;

pub use client_key::ClientKey;
pub use csrf::{CsrfConfig, OriginValidator};
pub use input_sanitizer::{BodyFormat, InputSanitizer, SanitizationVerdict, SanitizeConfig};
pub use pipeline::{Admission, DefenseLayer, DefensePipeline, DefenseService, RequestMeta, RouteRule};
pub use rate_limit::{
    DistributedRateLimiter, LimitOutcome, LocalRateLimiter, MemoryStore, PolicyTable,
    RateLimitDecision, RateLimitPolicy, RateLimitStore, RateLimitTier, RedisStore, TrafficClass,
};
pub use request_size::{PayloadCheck, PayloadLimit, PayloadValidator};
pub use verdict::{Rejection, Stage, Verdict};

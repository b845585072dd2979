//! Provider traits (LLM / OCR / CPU) and the rate limiter worker pools
//! use for admission control. Concrete HTTP/process clients are external
//! collaborators; this crate only defines the seams and test doubles.

pub mod mock;
pub mod rate_limiter;
pub mod traits;

pub use rate_limiter::{RateLimiter, SharedRateLimiter};
pub use traits::{CpuExecutor, LlmProvider, OcrProvider, ProviderResult};

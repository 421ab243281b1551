//! Challenge detection and resolution.
//!
//! `detectors` recognises verification pages from navigation results and
//! `resolver` hands solvable ones to the configured captcha service.

pub mod detectors;
pub mod resolver;
mod signal;

pub use detectors::{CaptchaChallenge, ChallengeDetector, ChallengeType};
pub use resolver::{CaptchaResolver, CaptchaToken, ResolutionFailed};
pub use signal::PageSignal;

//! Integrations that rely on third-party services.
//!
//! Groups the adapters for captcha solving vendors that bridge the
//! acquisition layer with the outside world.

pub mod captcha;

pub use captcha::{CapSolverProvider, TwoCaptchaProvider};

//! Resilience primitives shared by every component that talks to something
//! it does not control.
//!
//! The only primitive today is [`CircuitBreaker`]. It has no knowledge of
//! what it protects: the analysis server client, the result cache backend and
//! any other flaky dependency each get their own instance with their own
//! thresholds.

mod breaker;

pub use breaker::{
    BreakerConfig, BreakerConfigError, BreakerHealth, BreakerState, CallError, CircuitBreaker,
    Permit,
};

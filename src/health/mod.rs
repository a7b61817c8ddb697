//! Container health.
//!
//! [`HealthDetector`] is the pure hysteresis filter; [`TcpHealthProbe`] feeds
//! it from periodic TCP connects and publishes the edges on `tcp-health`.

pub mod detector;
pub mod probe;

pub use detector::HealthDetector;
pub use probe::{ProbeSettings, TcpHealthProbe};

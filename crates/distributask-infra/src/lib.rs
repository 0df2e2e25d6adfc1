//! Distributask Infrastructure Library
//!
//! Shared infrastructure used by the distributask binaries:
//! - Telemetry initialization (tracing subscriber, text or JSON output)

pub mod telemetry;

pub use telemetry::init_telemetry;

//! Telemetry bootstrap for probefleet services: structured logging via the
//! `tracing` ecosystem, in human-readable or JSON form.

pub mod logging;

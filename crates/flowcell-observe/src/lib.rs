//! Observability setup for flowcell: tracing subscriber and optional
//! OpenTelemetry span export.

pub mod tracing_setup;

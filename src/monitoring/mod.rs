#![allow(missing_docs)]
// Copyright (c) 2026 Meshline
// Licensed under the Apache License, Version 2.0

//! Observability: Prometheus metrics. Structured logging is configured
//! directly against `tracing_subscriber` at startup (see `main.rs`) rather
//! than wrapped here, matching how the rest of the stack uses `tracing`.

pub mod metrics;

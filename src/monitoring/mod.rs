#![forbid(unsafe_code)]
#![allow(missing_docs)]

//! Observability: Prometheus metrics container.

pub mod metrics;

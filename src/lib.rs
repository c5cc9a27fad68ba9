//! # StreamWeave Vertex
//!
//! Runtime for one map vertex of a partitioned stream topology.
//!
//! A map vertex reads records from its input buffer partitions, sends each
//! record through an out-of-process transformation handler, and routes every
//! result to the partitions of its downstream buffers while keeping the
//! event-time watermark moving.
//!
//! ## Key Pieces
//!
//! - **Output routing** ([`router`], [`partitioning`]): tag conditions on
//!   edges decide where a record goes; keyed-aggregation destinations are
//!   shuffled by key, everything else is spread round-robin.
//! - **Forwarding** ([`forward`]): one forwarder per input partition runs the
//!   read, transform, route, write, ack loop.
//! - **Lifecycle** ([`processor`]): provisions shared resources, runs one
//!   worker per partition, drains them on cancellation and tears everything
//!   down in order.
//! - **Boundaries** ([`isb`], [`watermark`], [`udf`], [`provision`]): traits
//!   for buffers, watermark stores and the handler, each with an in-process
//!   or HTTP implementation.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use streamweave_vertex::config::{RuntimeSettings, VertexInstance};
//! use streamweave_vertex::processor::MapUdfProcessor;
//! use streamweave_vertex::provision::InMemoryBackend;
//! use streamweave_vertex::udf::http::HttpUdfClientFactory;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> streamweave_vertex::error::Result<()> {
//! let vertex = Arc::new(VertexInstance::from_env()?);
//! let settings = RuntimeSettings::from_env()?;
//! let processor = MapUdfProcessor::new(
//!   settings.isbsvc_type,
//!   vertex,
//!   Arc::new(InMemoryBackend::new(settings.buffer_capacity)),
//!   Arc::new(HttpUdfClientFactory::from_settings(&settings)),
//! );
//! processor.start(CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

/// Vertex specification and runtime settings.
pub mod config;
/// Error types.
pub mod error;
/// Per-partition forwarder.
pub mod forward;
/// Inter-step buffer boundary.
pub mod isb;
/// Records and offsets.
pub mod message;
/// Prometheus-compatible metrics.
pub mod metrics;
/// Round-robin counter and key shuffle.
pub mod partitioning;
/// Forwarder lifecycle manager.
pub mod processor;
/// Buffer and watermark provisioning.
pub mod provision;
/// Output router.
pub mod router;
/// Edges and tag conditions.
pub mod topology;
/// Transformation handler boundary.
pub mod udf;
/// Watermark propagation.
pub mod watermark;


pub use error::{Error, Result};

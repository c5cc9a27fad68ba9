//! # Vertex Configuration
//!
//! Two sources of configuration, both read once at startup and never reloaded:
//!
//! - **Vertex specification** ([`VertexInstance`]): the topology this vertex
//!   sits in (incoming and outgoing edges, partition count, read batch size,
//!   watermark settings). Delivered as base64-encoded JSON in `VERTEX_OBJECT`.
//! - **Runtime settings** ([`RuntimeSettings`]): process-level knobs such as
//!   the buffer backend technology and handler address.
//!
//! Loaders take a lookup function instead of reading the process environment
//! directly, so tests can feed values without touching global state:
//!
//! ```rust,no_run
//! use streamweave_vertex::config::{RuntimeSettings, VertexInstance};
//!
//! let vertex = VertexInstance::from_env()?;
//! let settings = RuntimeSettings::from_env()?;
//! # Ok::<(), streamweave_vertex::error::Error>(())
//! ```

use crate::error::{Error, Result};
use crate::provision::IsbSvcType;
use crate::topology::Edge;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

/// Env var holding the base64-encoded vertex specification.
pub const ENV_VERTEX_OBJECT: &str = "VERTEX_OBJECT";
/// Env var holding this replica's index.
pub const ENV_VERTEX_REPLICA: &str = "VERTEX_REPLICA";
/// Env var holding the pod/host name.
pub const ENV_HOSTNAME: &str = "HOSTNAME";
/// Env var selecting the buffer backend technology.
pub const ENV_ISBSVC_TYPE: &str = "ISBSVC_TYPE";
/// Env var with the handler server address.
pub const ENV_UDF_SERVER_ADDR: &str = "UDF_SERVER_ADDR";
/// Env var with the maximum handler message size in bytes.
pub const ENV_UDF_MAX_MESSAGE_SIZE: &str = "UDF_MAX_MESSAGE_SIZE";
/// Env var with the metrics listen address. Metrics are off when unset.
pub const ENV_METRICS_ADDR: &str = "METRICS_ADDR";
/// Env var with the in-memory buffer capacity.
pub const ENV_BUFFER_CAPACITY: &str = "BUFFER_CAPACITY";

/// Annotation enabling the streaming handler call shape.
pub const MAP_STREAM_ANNOTATION: &str = "streamweave.io/map-stream";

/// Default handler message size limit (64 MiB).
pub const DEFAULT_UDF_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;
/// Default read batch size.
pub const DEFAULT_READ_BATCH_SIZE: usize = 500;
/// Default in-memory buffer capacity.
pub const DEFAULT_BUFFER_CAPACITY: usize = 30_000;
/// Default handler server address.
pub const DEFAULT_UDF_SERVER_ADDR: &str = "127.0.0.1:55551";

/// Throughput limits of a vertex.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VertexLimits {
  /// Maximum records read per batch.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub read_batch_size: Option<u64>,
}

/// Watermark settings of a vertex.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct WatermarkSpec {
  /// Disables watermark propagation entirely.
  #[serde(default)]
  pub disabled: bool,
}

/// Topology-facing part of a vertex specification.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VertexSpec {
  /// Edges feeding this vertex.
  #[serde(default)]
  pub from_edges: Vec<Edge>,
  /// Edges leaving this vertex.
  #[serde(default)]
  pub to_edges: Vec<Edge>,
  /// Number of input partitions; 1 when not set.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub partitions: Option<u16>,
  /// Throughput limits.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub limits: Option<VertexLimits>,
  /// Watermark settings.
  #[serde(default)]
  pub watermark: WatermarkSpec,
}

/// A vertex of a pipeline.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vertex {
  /// Vertex name, unique within the pipeline.
  pub name: String,
  /// Owning pipeline.
  pub pipeline_name: String,
  /// Free-form annotations.
  #[serde(default)]
  pub annotations: HashMap<String, String>,
  /// Specification.
  #[serde(default)]
  pub spec: VertexSpec,
}

impl Vertex {
  /// Number of input partitions.
  pub fn partition_count(&self) -> u16 {
    self.spec.partitions.unwrap_or(1).max(1)
  }

  /// Read batch size, if configured.
  pub fn read_batch_size(&self) -> Option<usize> {
    self
      .spec
      .limits
      .as_ref()
      .and_then(|l| l.read_batch_size)
      .map(|n| n as usize)
  }

  /// Returns true if watermark propagation is enabled.
  pub fn watermark_enabled(&self) -> bool {
    !self.spec.watermark.disabled
  }

  /// Returns true if the handler should be called in streaming mode.
  ///
  /// # Errors
  ///
  /// Returns `Error::Config` if the annotation is present but not a boolean.
  pub fn map_udf_stream_enabled(&self) -> Result<bool> {
    match self.annotations.get(MAP_STREAM_ANNOTATION) {
      None => Ok(false),
      Some(raw) => parse_bool(raw).ok_or_else(|| {
        Error::Config(format!(
          "failed to parse UDF map streaming metadata: {:?} is not a boolean",
          raw
        ))
      }),
    }
  }

  /// Outgoing edges as a shared slice, for handing to routers.
  pub fn to_edges(&self) -> Arc<[Edge]> {
    Arc::from(self.spec.to_edges.clone())
  }

  /// Names of the distinct destination vertices, in edge order.
  pub fn to_vertices(&self) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for edge in &self.spec.to_edges {
      if !names.contains(&edge.to) {
        names.push(edge.to.clone());
      }
    }
    names
  }

  /// Checks the specification; any problem is a startup failure.
  pub fn validate(&self) -> Result<()> {
    if self.name.is_empty() {
      return Err(Error::Config("vertex name must not be empty".to_string()));
    }
    if self.spec.partitions == Some(0) {
      return Err(Error::Config(format!(
        "vertex {}: partitions must be >= 1",
        self.name
      )));
    }
    if self.read_batch_size() == Some(0) {
      return Err(Error::Config(format!(
        "vertex {}: readBatchSize must be >= 1",
        self.name
      )));
    }
    for edge in self.spec.from_edges.iter().chain(self.spec.to_edges.iter()) {
      edge.validate()?;
    }
    for edge in &self.spec.to_edges {
      if edge.from != self.name {
        return Err(Error::Config(format!(
          "outgoing edge {} -> {} does not start at vertex {}",
          edge.from, edge.to, self.name
        )));
      }
    }
    Ok(())
  }
}

/// One running replica of a vertex.
#[derive(Clone, Debug, PartialEq)]
pub struct VertexInstance {
  /// The vertex.
  pub vertex: Vertex,
  /// Host (pod) name.
  pub hostname: String,
  /// Replica index.
  pub replica: u32,
}

impl VertexInstance {
  /// Creates an instance and validates the vertex.
  pub fn new(vertex: Vertex, hostname: impl Into<String>, replica: u32) -> Result<Self> {
    vertex.validate()?;
    Ok(Self {
      vertex,
      hostname: hostname.into(),
      replica,
    })
  }

  /// Loads the instance from the process environment.
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  /// Loads the instance using `lookup` to resolve env-style keys.
  pub fn from_lookup<F>(lookup: F) -> Result<Self>
  where
    F: Fn(&str) -> Option<String>,
  {
    let encoded = lookup(ENV_VERTEX_OBJECT)
      .ok_or_else(|| Error::Config(format!("{} is not set", ENV_VERTEX_OBJECT)))?;
    let decoded = STANDARD
      .decode(encoded.trim())
      .map_err(|e| Error::Config(format!("failed to decode {}: {}", ENV_VERTEX_OBJECT, e)))?;
    let vertex: Vertex = serde_json::from_slice(&decoded)
      .map_err(|e| Error::Config(format!("failed to parse {}: {}", ENV_VERTEX_OBJECT, e)))?;
    let replica = lookup_env_or(&lookup, ENV_VERTEX_REPLICA, 0u32)?;
    let hostname = lookup(ENV_HOSTNAME).unwrap_or_else(|| format!("{}-{}", vertex.name, replica));
    Self::new(vertex, hostname, replica)
  }

  /// Name of the buffer backing input partition `idx`.
  pub fn buffer_name(&self, vertex: &str, idx: u16) -> String {
    format!("{}-{}-{}", self.vertex.pipeline_name, vertex, idx)
  }

  /// Names of the buffer partitions this vertex reads from, in partition
  /// order.
  pub fn owned_buffers(&self) -> Vec<String> {
    (0..self.vertex.partition_count())
      .map(|idx| self.buffer_name(&self.vertex.name, idx))
      .collect()
  }

  /// Names of every destination buffer partition, grouped by destination.
  pub fn to_buffers(&self) -> Vec<(String, Vec<String>)> {
    let mut result: Vec<(String, Vec<String>)> = Vec::new();
    for edge in &self.vertex.spec.to_edges {
      if result.iter().any(|(name, _)| *name == edge.to) {
        continue;
      }
      let partitions = (0..edge.partition_count())
        .map(|idx| self.buffer_name(&edge.to, idx))
        .collect();
      result.push((edge.to.clone(), partitions));
    }
    result
  }

  /// Name of the watermark store shared by the two ends of an edge.
  pub fn edge_store_name(&self, from: &str, to: &str) -> String {
    format!("{}-{}-{}", self.vertex.pipeline_name, from, to)
  }

  /// Name this replica publishes watermarks under.
  pub fn processor_entity(&self) -> String {
    format!("{}-{}", self.vertex.name, self.replica)
  }
}

/// Process-level settings.
#[derive(Clone, Debug)]
pub struct RuntimeSettings {
  /// Buffer backend technology.
  pub isbsvc_type: IsbSvcType,
  /// Handler server address (`host:port`).
  pub udf_server_addr: String,
  /// Largest handler response accepted.
  pub udf_max_message_size: usize,
  /// Metrics listen address; metrics are off when `None`.
  pub metrics_addr: Option<SocketAddr>,
  /// Capacity of each in-memory buffer partition.
  pub buffer_capacity: usize,
}

impl RuntimeSettings {
  /// Creates settings for `isbsvc_type` with defaults for everything else.
  pub fn new(isbsvc_type: IsbSvcType) -> Self {
    Self {
      isbsvc_type,
      udf_server_addr: DEFAULT_UDF_SERVER_ADDR.to_string(),
      udf_max_message_size: DEFAULT_UDF_MAX_MESSAGE_SIZE,
      metrics_addr: None,
      buffer_capacity: DEFAULT_BUFFER_CAPACITY,
    }
  }

  /// Sets the handler server address.
  #[must_use]
  pub fn with_udf_server_addr(mut self, addr: impl Into<String>) -> Self {
    self.udf_server_addr = addr.into();
    self
  }

  /// Sets the metrics listen address.
  #[must_use]
  pub fn with_metrics_addr(mut self, addr: Option<SocketAddr>) -> Self {
    self.metrics_addr = addr;
    self
  }

  /// Loads settings from the process environment.
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  /// Loads settings using `lookup` to resolve env-style keys.
  pub fn from_lookup<F>(lookup: F) -> Result<Self>
  where
    F: Fn(&str) -> Option<String>,
  {
    let isbsvc_type = lookup(ENV_ISBSVC_TYPE)
      .ok_or_else(|| Error::Config(format!("{} is not set", ENV_ISBSVC_TYPE)))?
      .parse::<IsbSvcType>()?;
    let metrics_addr = match lookup(ENV_METRICS_ADDR) {
      Some(raw) if !raw.is_empty() => Some(raw.parse::<SocketAddr>().map_err(|e| {
        Error::Config(format!("invalid {} {:?}: {}", ENV_METRICS_ADDR, raw, e))
      })?),
      _ => None,
    };
    let settings = Self {
      isbsvc_type,
      udf_server_addr: lookup(ENV_UDF_SERVER_ADDR)
        .unwrap_or_else(|| DEFAULT_UDF_SERVER_ADDR.to_string()),
      udf_max_message_size: lookup_env_or(
        &lookup,
        ENV_UDF_MAX_MESSAGE_SIZE,
        DEFAULT_UDF_MAX_MESSAGE_SIZE,
      )?,
      metrics_addr,
      buffer_capacity: lookup_env_or(&lookup, ENV_BUFFER_CAPACITY, DEFAULT_BUFFER_CAPACITY)?,
    };
    settings.validate()?;
    Ok(settings)
  }

  /// Validates the settings.
  pub fn validate(&self) -> Result<()> {
    if self.udf_max_message_size == 0 {
      return Err(Error::Config(format!(
        "{} must be > 0",
        ENV_UDF_MAX_MESSAGE_SIZE
      )));
    }
    if self.buffer_capacity == 0 {
      return Err(Error::Config(format!("{} must be > 0", ENV_BUFFER_CAPACITY)));
    }
    Ok(())
  }

  /// Checks that one read batch of `vertex` fits in a destination buffer.
  pub fn check_read_batch_size(&self, vertex: &Vertex) -> Result<()> {
    let batch = vertex.read_batch_size().unwrap_or(DEFAULT_READ_BATCH_SIZE);
    if batch > self.buffer_capacity {
      return Err(Error::Config(format!(
        "read batch size {} exceeds {} ({})",
        batch, ENV_BUFFER_CAPACITY, self.buffer_capacity
      )));
    }
    Ok(())
  }
}

/// Resolves `key` with `lookup` and parses it, falling back to `default`
/// when the key is unset.
///
/// # Errors
///
/// Returns `Error::Config` if the value is set but does not parse.
pub fn lookup_env_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
  F: Fn(&str) -> Option<String>,
  T: FromStr,
  T::Err: std::fmt::Display,
{
  match lookup(key) {
    None => Ok(default),
    Some(raw) => raw
      .trim()
      .parse::<T>()
      .map_err(|e| Error::Config(format!("invalid {} {:?}: {}", key, raw, e))),
  }
}

/// Parses the boolean spellings accepted by the control plane.
pub fn parse_bool(raw: &str) -> Option<bool> {
  match raw {
    "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
    "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
    _ => None,
  }
}

//! # Topology Edges
//!
//! Edges describe where a vertex sends its output: the destination vertex,
//! how many partitions that destination owns, what kind of stage it is, and an
//! optional tag condition that filters which records travel along the edge.
//!
//! Edges are immutable and loaded once at startup together with the rest of
//! the vertex specification. Malformed edges are rejected by
//! [`Edge::validate`] at load time so that routing itself never has to fail.
//!
//! ## Tag conditions
//!
//! | operator | matches when                                  |
//! |----------|-----------------------------------------------|
//! | `and`    | every required value is present in the tags    |
//! | `or`     | at least one required value is present         |
//! | `not`    | none of the required values is present         |
//!
//! A missing condition, or one with no required values, matches every record
//! that is not dropped.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Reserved tag meaning "do not forward this record anywhere".
pub const MESSAGE_TAG_DROP: &str = "U+005C__DROP__";

/// Returns true if `tags` carry [`MESSAGE_TAG_DROP`].
pub fn is_dropped(tags: &[String]) -> bool {
  tags.iter().any(|t| t == MESSAGE_TAG_DROP)
}

/// Kind of processing stage a vertex is.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VertexType {
  /// Data source.
  Source,
  /// Record-at-a-time map stage.
  MapUdf,
  /// Keyed aggregation stage; receives shuffled input.
  ReduceUdf,
  /// Data sink.
  Sink,
}

/// Logical operator applied between an edge's required tag values and a
/// record's tags.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalOperator {
  /// All required values must be present.
  And,
  /// At least one required value must be present.
  #[default]
  Or,
  /// None of the required values may be present.
  Not,
}

/// Tag-based condition attached to an edge.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct TagConditions {
  /// Operator; `or` when not set.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub operator: Option<LogicalOperator>,
  /// Required tag values.
  #[serde(default)]
  pub values: Vec<String>,
}

impl TagConditions {
  /// Creates a condition with an explicit operator.
  pub fn new(operator: LogicalOperator, values: Vec<String>) -> Self {
    Self {
      operator: Some(operator),
      values,
    }
  }

  /// Returns the effective operator.
  pub fn operator(&self) -> LogicalOperator {
    self.operator.unwrap_or_default()
  }

  /// Returns true if `tags` satisfy this condition.
  ///
  /// An empty set of required values always matches.
  pub fn matches(&self, tags: &[String]) -> bool {
    if self.values.is_empty() {
      return true;
    }
    compare_tags(self.operator(), tags, &self.values)
  }
}

/// Applies `operator` to a record's `tags` against the `required` values.
pub fn compare_tags(operator: LogicalOperator, tags: &[String], required: &[String]) -> bool {
  let present = |value: &String| tags.iter().any(|t| t == value);
  match operator {
    LogicalOperator::And => required.iter().all(present),
    LogicalOperator::Or => required.iter().any(present),
    LogicalOperator::Not => !required.iter().any(present),
  }
}

/// Conditions under which a record is forwarded along an edge.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ForwardConditions {
  /// Tag condition, if any.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub tags: Option<TagConditions>,
}

/// Directed link from one vertex to another.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
  /// Source vertex name.
  pub from: String,
  /// Destination vertex name.
  pub to: String,
  /// Optional forwarding condition.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub conditions: Option<ForwardConditions>,
  /// Kind of the source vertex.
  pub from_vertex_type: VertexType,
  /// Kind of the destination vertex.
  pub to_vertex_type: VertexType,
  /// Number of partitions owned by the destination; 1 when not set.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub to_vertex_partition_count: Option<u16>,
}

impl Edge {
  /// Creates an unconditioned edge.
  pub fn new(
    from: impl Into<String>,
    to: impl Into<String>,
    to_vertex_type: VertexType,
    to_vertex_partition_count: u16,
  ) -> Self {
    Self {
      from: from.into(),
      to: to.into(),
      conditions: None,
      from_vertex_type: VertexType::MapUdf,
      to_vertex_type,
      to_vertex_partition_count: Some(to_vertex_partition_count),
    }
  }

  /// Attaches a tag condition.
  #[must_use]
  pub fn with_tag_conditions(mut self, tags: TagConditions) -> Self {
    self.conditions = Some(ForwardConditions { tags: Some(tags) });
    self
  }

  /// Sets the source vertex kind.
  #[must_use]
  pub fn with_from_vertex_type(mut self, from_vertex_type: VertexType) -> Self {
    self.from_vertex_type = from_vertex_type;
    self
  }

  /// Returns the destination partition count.
  pub fn partition_count(&self) -> u16 {
    self.to_vertex_partition_count.unwrap_or(1)
  }

  /// Returns true if records on this edge are distributed by key.
  pub fn needs_shuffle(&self) -> bool {
    self.to_vertex_type == VertexType::ReduceUdf && self.partition_count() > 1
  }

  /// Returns true if a (non-dropped) record with `tags` travels along this edge.
  pub fn matches(&self, tags: &[String]) -> bool {
    match self.conditions.as_ref().and_then(|c| c.tags.as_ref()) {
      None => true,
      Some(condition) => condition.matches(tags),
    }
  }

  /// Rejects edges that routing could not honour.
  pub fn validate(&self) -> Result<()> {
    if self.from.is_empty() || self.to.is_empty() {
      return Err(Error::Config(format!(
        "edge {:?} -> {:?} must name both vertices",
        self.from, self.to
      )));
    }
    if self.partition_count() == 0 {
      return Err(Error::Config(format!(
        "edge {} -> {}: destination partition count must be >= 1",
        self.from, self.to
      )));
    }
    Ok(())
  }
}

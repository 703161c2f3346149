//! Core metric types shared by the agent and the server.

use std::collections::{HashMap, HashSet};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use compact_str::CompactString;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

// ============================================================================
// METRIC KIND
// ============================================================================

/// Kind of a metric: decides which value slot is populated and how updates
/// combine with stored state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Last write wins
    Gauge,
    /// Deltas accumulate
    Counter,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
        }
    }
}

impl Display for MetricKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gauge" => Ok(MetricKind::Gauge),
            "counter" => Ok(MetricKind::Counter),
            other => Err(ValidationError::InvalidKind { kind: other.to_string() }),
        }
    }
}

// ============================================================================
// METRIC IDENTITY
// ============================================================================

/// Composite key identifying one metric's stored state.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MetricId {
    #[serde(rename = "id")]
    pub name: CompactString,
    #[serde(rename = "type")]
    pub kind: MetricKind,
}

impl MetricId {
    pub fn new(name: impl Into<CompactString>, kind: MetricKind) -> Self {
        Self { name: name.into(), kind }
    }

    pub fn counter(name: impl Into<CompactString>) -> Self {
        Self::new(name, MetricKind::Counter)
    }

    pub fn gauge(name: impl Into<CompactString>) -> Self {
        Self::new(name, MetricKind::Gauge)
    }
}

impl Display for MetricId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

// ============================================================================
// METRIC
// ============================================================================

/// A validated metric.
///
/// Exactly one of `delta` / `value` is populated, chosen by `id.kind`. The
/// constructors and [`crate::validation`] are the only producers; storage
/// backends never check it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    #[serde(flatten)]
    pub id: MetricId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl Metric {
    pub fn counter(name: impl Into<CompactString>, delta: i64) -> Self {
        Self { id: MetricId::counter(name), delta: Some(delta), value: None }
    }

    pub fn gauge(name: impl Into<CompactString>, value: f64) -> Self {
        Self { id: MetricId::gauge(name), delta: None, value: Some(value) }
    }

    pub fn name(&self) -> &str {
        &self.id.name
    }

    pub fn kind(&self) -> MetricKind {
        self.id.kind
    }

    /// Plain-text rendering of the current value: integer for counters,
    /// shortest round-trip decimal for gauges (`36.6`, `5`).
    pub fn render_value(&self) -> String {
        match self.id.kind {
            MetricKind::Counter => self.delta.unwrap_or_default().to_string(),
            MetricKind::Gauge => self.value.unwrap_or_default().to_string(),
        }
    }
}

impl From<&Metric> for MetricPayload {
    fn from(metric: &Metric) -> Self {
        Self {
            id: metric.id.name.to_string(),
            kind: metric.id.kind.as_str().to_string(),
            delta: metric.delta,
            value: metric.value,
        }
    }
}

// ============================================================================
// WIRE PAYLOAD
// ============================================================================

/// Untrusted wire form of a metric.
///
/// `type` stays a string so that an unknown kind surfaces as a validation
/// failure rather than a decode failure.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricPayload {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl MetricPayload {
    pub fn counter(id: impl Into<String>, delta: i64) -> Self {
        Self { id: id.into(), kind: "counter".into(), delta: Some(delta), value: None }
    }

    pub fn gauge(id: impl Into<String>, value: f64) -> Self {
        Self { id: id.into(), kind: "gauge".into(), delta: None, value: Some(value) }
    }
}

// ============================================================================
// COLLECTIONS
// ============================================================================

/// Ordered metrics collected within one poll interval
pub type Batch = Vec<Metric>;

/// Result shape of a storage lookup
pub type MetricMap = HashMap<MetricId, Metric>;

/// Set of ids to look up; empty means "all".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricFilter {
    ids: HashSet<MetricId>,
}

impl MetricFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn is_all(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn matches(&self, id: &MetricId) -> bool {
        self.ids.is_empty() || self.ids.contains(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &MetricId> {
        self.ids.iter()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl FromIterator<MetricId> for MetricFilter {
    fn from_iter<I: IntoIterator<Item = MetricId>>(iter: I) -> Self {
        Self { ids: iter.into_iter().collect() }
    }
}

impl<'a> FromIterator<&'a MetricId> for MetricFilter {
    fn from_iter<I: IntoIterator<Item = &'a MetricId>>(iter: I) -> Self {
        Self { ids: iter.into_iter().cloned().collect() }
    }
}

//! Chart configurations generated for query results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Supported chart shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartType {
    Bar,
    Line,
    Area,
    Pie,
    Scatter,
}

/// One axis or series binding: which result column feeds it and how it
/// is labeled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxisConfig {
    pub column: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// A chart configuration for one query.
///
/// The forward model is one visualization per query; older documents
/// keyed by message id alone are still readable (`query_id` absent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Visualization {
    pub id: String,
    pub chat_id: String,
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_id: Option<String>,
    pub chart_type: ChartType,
    pub x_axis: AxisConfig,
    pub y_axis: Vec<AxisConfig>,
    /// Hex colors, one per series.
    #[serde(default)]
    pub colors: Vec<String>,
    /// Query optimized for chart data (aggregated, bounded).
    pub fetch_query: String,
    /// Row count the fetch query is expected to produce.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub projected_row_count: Option<u64>,
    pub created_at: DateTime<Utc>,
}

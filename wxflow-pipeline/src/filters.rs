//! Line filters for intersection filter chains.
//!
//! Both filters read [`IntersectionLines`] from the input registered under the
//! empty prefix and emit the same geometry with a reduced selection, so they
//! can be chained in any order.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use wxflow_core::fields::{
    GEOLENFILTER_OP, GEOLENFILTER_VALUE, VARFILTER_OP, VARFILTER_PREFIX, VARFILTER_VALUE,
};
use wxflow_core::{
    DataItem, IntersectionLines, RequestKey, RequestKeyError, SourceError, WxflowResult,
};

use crate::source::{DataHandle, DataProducer, ProduceContext};

/// Kilometres per degree of latitude.
const KM_PER_DEGREE: f64 = 111.2;

/// Comparison applied by a filter to a line property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionOp {
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    Equal,
}

impl SelectionOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionOp::Less => "LESS",
            SelectionOp::LessOrEqual => "LESS_OR_EQUAL",
            SelectionOp::Greater => "GREATER",
            SelectionOp::GreaterOrEqual => "GREATER_OR_EQUAL",
            SelectionOp::Equal => "EQUAL",
        }
    }

    /// Whether `value` passes against `threshold`.
    pub fn apply(&self, value: f64, threshold: f64) -> bool {
        match self {
            SelectionOp::Less => value < threshold,
            SelectionOp::LessOrEqual => value <= threshold,
            SelectionOp::Greater => value > threshold,
            SelectionOp::GreaterOrEqual => value >= threshold,
            SelectionOp::Equal => value == threshold,
        }
    }

    fn from_request(request: &RequestKey, key: &str) -> Result<Self, RequestKeyError> {
        let raw = request.value(key)?;
        raw.parse().map_err(|reason| RequestKeyError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
            reason,
        })
    }
}

impl fmt::Display for SelectionOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LESS" => Ok(SelectionOp::Less),
            "LESS_OR_EQUAL" => Ok(SelectionOp::LessOrEqual),
            "GREATER" => Ok(SelectionOp::Greater),
            "GREATER_OR_EQUAL" => Ok(SelectionOp::GreaterOrEqual),
            "EQUAL" => Ok(SelectionOp::Equal),
            other => Err(format!("unknown selection operator {:?}", other)),
        }
    }
}

fn lines_of<'a>(
    handle: &'a DataHandle,
    source_name: &str,
    request: &RequestKey,
) -> WxflowResult<&'a IntersectionLines> {
    handle.as_lines().ok_or_else(|| {
        SourceError::ProductionFailed {
            source_name: source_name.to_string(),
            request: request.to_string(),
            reason: format!("input is {:?}, not line geometry", handle.kind()),
        }
        .into()
    })
}

// ============================================================================
// GEOMETRIC LENGTH FILTER
// ============================================================================

/// Keeps lines whose horizontal length in km passes `GEOLENFILTER_OP`
/// against `GEOLENFILTER_VALUE`.
#[derive(Debug, Clone)]
pub struct GeometricLengthFilter {
    name: String,
}

impl GeometricLengthFilter {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Horizontal length of a polyline of `(lon, lat, _)` vertices, in km.
    pub fn line_length_km(vertices: &[[f32; 3]]) -> f64 {
        vertices
            .windows(2)
            .map(|pair| {
                let (lon0, lat0) = (pair[0][0] as f64, pair[0][1] as f64);
                let (lon1, lat1) = (pair[1][0] as f64, pair[1][1] as f64);
                let mean_lat = ((lat0 + lat1) / 2.0).to_radians();
                let dx = (lon1 - lon0) * KM_PER_DEGREE * mean_lat.cos();
                let dy = (lat1 - lat0) * KM_PER_DEGREE;
                (dx * dx + dy * dy).sqrt()
            })
            .sum()
    }
}

impl Default for GeometricLengthFilter {
    fn default() -> Self {
        Self::new("GeometricLengthFilter")
    }
}

#[async_trait]
impl DataProducer for GeometricLengthFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn locally_required_keys(&self) -> Vec<String> {
        vec![GEOLENFILTER_OP.to_string(), GEOLENFILTER_VALUE.to_string()]
    }

    async fn produce(
        &self,
        request: &RequestKey,
        ctx: &ProduceContext,
    ) -> WxflowResult<Arc<dyn DataItem>> {
        let op = SelectionOp::from_request(request, GEOLENFILTER_OP)?;
        let threshold = request.float_value(GEOLENFILTER_VALUE)?;

        let input = ctx.fetch_input("", request).await?;
        let lines = lines_of(&input, &self.name, request)?;

        let selection = lines.selection.retain_lines(|line| {
            let range = lines.selection.line_range(line);
            lines
                .vertices
                .get(range)
                .is_some_and(|vertices| op.apply(Self::line_length_km(vertices), threshold))
        });
        tracing::debug!(
            source = %self.name,
            op = %op,
            threshold,
            kept = selection.num_lines(),
            of = lines.selection.num_lines(),
            "Length filter applied"
        );
        Ok(Arc::new(lines.with_selection(selection)))
    }
}

// ============================================================================
// VALUE THRESHOLD FILTER
// ============================================================================

/// Keeps lines with at least one vertex whose value passes `VARFILTER_OP`
/// against `VARFILTER_VALUE`.
///
/// Values come from the input registered under `VARFILTER_`, one per vertex
/// of the unfiltered geometry.
#[derive(Debug, Clone)]
pub struct ValueThresholdFilter {
    name: String,
}

impl ValueThresholdFilter {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for ValueThresholdFilter {
    fn default() -> Self {
        Self::new("ValueThresholdFilter")
    }
}

#[async_trait]
impl DataProducer for ValueThresholdFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn locally_required_keys(&self) -> Vec<String> {
        vec![VARFILTER_OP.to_string(), VARFILTER_VALUE.to_string()]
    }

    async fn produce(
        &self,
        request: &RequestKey,
        ctx: &ProduceContext,
    ) -> WxflowResult<Arc<dyn DataItem>> {
        let op = SelectionOp::from_request(request, VARFILTER_OP)?;
        let threshold = request.float_value(VARFILTER_VALUE)?;

        let input = ctx.fetch_input("", request).await?;
        let lines = lines_of(&input, &self.name, request)?;
        let values_handle = ctx.fetch_input(VARFILTER_PREFIX, request).await?;
        let Some(values) = values_handle.as_line_values() else {
            return Err(SourceError::ProductionFailed {
                source_name: self.name.clone(),
                request: request.to_string(),
                reason: format!("value input is {:?}, not line values", values_handle.kind()),
            }
            .into());
        };
        if values.values.len() != lines.vertices.len() {
            return Err(SourceError::ProductionFailed {
                source_name: self.name.clone(),
                request: request.to_string(),
                reason: format!(
                    "{} values for {} vertices",
                    values.values.len(),
                    lines.vertices.len()
                ),
            }
            .into());
        }

        let selection = lines.selection.retain_lines(|line| {
            let range = lines.selection.line_range(line);
            values.values.get(range).is_some_and(|vs| {
                vs.iter().any(|v| !v.is_nan() && op.apply(*v as f64, threshold))
            })
        });
        tracing::debug!(
            source = %self.name,
            op = %op,
            threshold,
            kept = selection.num_lines(),
            of = lines.selection.num_lines(),
            "Value filter applied"
        );
        Ok(Arc::new(lines.with_selection(selection)))
    }
}

//! Data items produced by sources and held by the resource caches.
//!
//! Consumers never downcast. Every item reports an [`ItemKind`] tag and
//! exposes optional capability accessors (`as_grid`, `as_hybrid_sigma`,
//! `as_lines`, ...) that return `Some` only for the matching variant.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::RequestKeyError;

/// Size accounting used by the memory managers.
pub trait MemorySized {
    /// Memory footprint in kilobytes.
    fn memory_size_kb(&self) -> u64;
}

/// Round a byte count up to whole kilobytes.
pub fn bytes_to_kb(bytes: usize) -> u64 {
    (bytes as u64).div_ceil(1024)
}

// ============================================================================
// ITEM TRAIT
// ============================================================================

/// Tag identifying the variant of a [`DataItem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemKind {
    /// A gridded NWP field.
    Grid,
    /// Line geometry with a line/member selection.
    Lines,
    /// Per-vertex values sampled along lines.
    LineValues,
    /// A GPU-side texture handle.
    Texture,
    /// Anything else a producer chooses to cache.
    Opaque,
}

/// A computed resource.
pub trait DataItem: MemorySized + Send + Sync + fmt::Debug + 'static {
    fn kind(&self) -> ItemKind;

    fn as_grid(&self) -> Option<&StructuredGrid> {
        None
    }

    /// Hybrid sigma-pressure coefficients, if this is a grid of that topology.
    fn as_hybrid_sigma(&self) -> Option<&HybridSigmaCoefficients> {
        self.as_grid().and_then(StructuredGrid::hybrid_sigma)
    }

    fn as_lines(&self) -> Option<&IntersectionLines> {
        None
    }

    fn as_selection(&self) -> Option<&LineSelection> {
        self.as_lines().map(|lines| &lines.selection)
    }

    fn as_line_values(&self) -> Option<&LineValues> {
        None
    }

    fn as_texture(&self) -> Option<&GpuTexture> {
        None
    }
}

// ============================================================================
// GRIDS
// ============================================================================

/// Vertical level type of a gridded variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LevelType {
    Surface2D,
    PressureLevels3D,
    HybridSigmaPressure3D,
    PotentialVorticity2D,
    LogPressureLevels3D,
    AuxiliaryPressure3D,
}

impl LevelType {
    /// Value used in the `LEVELTYPE` request field.
    pub fn as_str(&self) -> &'static str {
        match self {
            LevelType::Surface2D => "SURFACE_2D",
            LevelType::PressureLevels3D => "PRESSURE_LEVELS_3D",
            LevelType::HybridSigmaPressure3D => "HYBRID_SIGMA_PRESSURE_3D",
            LevelType::PotentialVorticity2D => "POTENTIAL_VORTICITY_2D",
            LevelType::LogPressureLevels3D => "LOG_PRESSURE_LEVELS_3D",
            LevelType::AuxiliaryPressure3D => "AUXILIARY_PRESSURE_3D",
        }
    }
}

impl fmt::Display for LevelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LevelType {
    type Err = RequestKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SURFACE_2D" => Ok(LevelType::Surface2D),
            "PRESSURE_LEVELS_3D" => Ok(LevelType::PressureLevels3D),
            "HYBRID_SIGMA_PRESSURE_3D" => Ok(LevelType::HybridSigmaPressure3D),
            "POTENTIAL_VORTICITY_2D" => Ok(LevelType::PotentialVorticity2D),
            "LOG_PRESSURE_LEVELS_3D" => Ok(LevelType::LogPressureLevels3D),
            "AUXILIARY_PRESSURE_3D" => Ok(LevelType::AuxiliaryPressure3D),
            other => Err(RequestKeyError::InvalidValue {
                key: crate::fields::LEVELTYPE.to_string(),
                value: other.to_string(),
                reason: "unknown level type".to_string(),
            }),
        }
    }
}

/// Hybrid sigma-pressure vertical coordinate: `p = ak + bk * surface_pressure`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridSigmaCoefficients {
    pub ak_hpa: Vec<f32>,
    pub bk: Vec<f32>,
    /// Surface pressure per horizontal grid point.
    pub surface_pressure_hpa: Vec<f32>,
}

/// Vertical topology of a grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GridTopology {
    /// Fixed levels; `levels` of the grid are the level values.
    Regular,
    HybridSigmaPressure(HybridSigmaCoefficients),
}

/// A structured lon/lat/level field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredGrid {
    pub variable: String,
    pub level_type: LevelType,
    pub lons: Vec<f32>,
    pub lats: Vec<f32>,
    pub levels: Vec<f32>,
    /// Values in level-major, then lat, then lon order.
    pub data: Vec<f32>,
    pub topology: GridTopology,
}

impl StructuredGrid {
    pub fn hybrid_sigma(&self) -> Option<&HybridSigmaCoefficients> {
        match &self.topology {
            GridTopology::HybridSigmaPressure(coefficients) => Some(coefficients),
            GridTopology::Regular => None,
        }
    }

    pub fn num_values(&self) -> usize {
        self.lons.len() * self.lats.len() * self.levels.len().max(1)
    }

    /// Minimum and maximum of all non-NaN values.
    pub fn value_range(&self) -> Option<(f32, f32)> {
        self.data
            .iter()
            .copied()
            .filter(|v| !v.is_nan())
            .fold(None, |acc, v| match acc {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            })
    }
}

impl MemorySized for StructuredGrid {
    fn memory_size_kb(&self) -> u64 {
        let mut floats = self.lons.len() + self.lats.len() + self.levels.len() + self.data.len();
        if let GridTopology::HybridSigmaPressure(c) = &self.topology {
            floats += c.ak_hpa.len() + c.bk.len() + c.surface_pressure_hpa.len();
        }
        bytes_to_kb(floats * std::mem::size_of::<f32>())
    }
}

impl DataItem for StructuredGrid {
    fn kind(&self) -> ItemKind {
        ItemKind::Grid
    }

    fn as_grid(&self) -> Option<&StructuredGrid> {
        Some(self)
    }
}

// ============================================================================
// LINES
// ============================================================================

/// Selection of lines out of a vertex buffer, grouped by ensemble member.
///
/// Line `i` covers vertices `start_indices[i] .. start_indices[i] + index_counts[i]`.
/// Member `m` covers lines `ensemble_start[m] .. ensemble_start[m] + ensemble_count[m]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineSelection {
    pub start_indices: Vec<u32>,
    pub index_counts: Vec<u32>,
    pub ensemble_start: Vec<u32>,
    pub ensemble_count: Vec<u32>,
}

impl LineSelection {
    pub fn num_lines(&self) -> usize {
        self.start_indices.len()
    }

    pub fn num_members(&self) -> usize {
        self.ensemble_start.len()
    }

    pub fn is_empty(&self) -> bool {
        self.start_indices.is_empty()
    }

    /// Vertex index range of line `i`.
    pub fn line_range(&self, i: usize) -> std::ops::Range<usize> {
        let start = self.start_indices[i] as usize;
        start..start + self.index_counts[i] as usize
    }

    /// Line index range of member `m`.
    pub fn member_lines(&self, m: usize) -> std::ops::Range<usize> {
        let start = self.ensemble_start[m] as usize;
        start..start + self.ensemble_count[m] as usize
    }

    /// Keep only the lines for which `keep(line_index)` holds. Member groups
    /// are rebuilt so that every member keeps its slot, possibly empty.
    pub fn retain_lines<F>(&self, mut keep: F) -> LineSelection
    where
        F: FnMut(usize) -> bool,
    {
        let mut out = LineSelection::default();
        for m in 0..self.num_members() {
            out.ensemble_start.push(out.start_indices.len() as u32);
            for line in self.member_lines(m) {
                if keep(line) {
                    out.start_indices.push(self.start_indices[line]);
                    out.index_counts.push(self.index_counts[line]);
                }
            }
            out.ensemble_count
                .push(out.start_indices.len() as u32 - out.ensemble_start[m]);
        }
        out
    }
}

/// Intersection line geometry (lon, lat, pressure per vertex) with a selection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntersectionLines {
    pub vertices: Vec<[f32; 3]>,
    pub selection: LineSelection,
}

impl IntersectionLines {
    /// Same geometry under a different selection.
    pub fn with_selection(&self, selection: LineSelection) -> Self {
        Self {
            vertices: self.vertices.clone(),
            selection,
        }
    }
}

impl MemorySized for IntersectionLines {
    fn memory_size_kb(&self) -> u64 {
        let s = &self.selection;
        let words = s.start_indices.len()
            + s.index_counts.len()
            + s.ensemble_start.len()
            + s.ensemble_count.len();
        bytes_to_kb(
            self.vertices.len() * std::mem::size_of::<[f32; 3]>() + words * std::mem::size_of::<u32>(),
        )
    }
}

impl DataItem for IntersectionLines {
    fn kind(&self) -> ItemKind {
        ItemKind::Lines
    }

    fn as_lines(&self) -> Option<&IntersectionLines> {
        Some(self)
    }
}

/// Values sampled at every line vertex, with an optional thickness variable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LineValues {
    pub values: Vec<f32>,
    pub thickness: Option<Vec<f32>>,
}

impl MemorySized for LineValues {
    fn memory_size_kb(&self) -> u64 {
        let n = self.values.len() + self.thickness.as_ref().map_or(0, Vec::len);
        bytes_to_kb(n * std::mem::size_of::<f32>())
    }
}

impl DataItem for LineValues {
    fn kind(&self) -> ItemKind {
        ItemKind::LineValues
    }

    fn as_line_values(&self) -> Option<&LineValues> {
        Some(self)
    }
}

// ============================================================================
// TEXTURES
// ============================================================================

/// Descriptor of an uploaded GPU texture. The renderer owns the real object;
/// the cache only tracks lifetime and size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuTexture {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub bytes_per_texel: u32,
}

impl MemorySized for GpuTexture {
    fn memory_size_kb(&self) -> u64 {
        let bytes = self.width as u64
            * self.height as u64
            * self.depth.max(1) as u64
            * self.bytes_per_texel as u64;
        bytes.div_ceil(1024)
    }
}

impl DataItem for GpuTexture {
    fn kind(&self) -> ItemKind {
        ItemKind::Texture
    }

    fn as_texture(&self) -> Option<&GpuTexture> {
        Some(self)
    }
}

// ============================================================================
// TESTS
// ============================================================================

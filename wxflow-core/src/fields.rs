//! Well-known request field names.
//!
//! The core protocol treats every field as opaque; these constants only keep
//! producers and consumers agreeing on spelling.

// ============================================================================
// NWP VARIABLE FIELDS
// ============================================================================

pub const LEVELTYPE: &str = "LEVELTYPE";
pub const VARIABLE: &str = "VARIABLE";
pub const INIT_TIME: &str = "INIT_TIME";
pub const VALID_TIME: &str = "VALID_TIME";
pub const MEMBER: &str = "MEMBER";
pub const ENS_OPERATION: &str = "ENS_OPERATION";
pub const MEMBER_RANGE: &str = "MEMBER_RANGE";
pub const MEMBERS: &str = "MEMBERS";

// ============================================================================
// LINE FILTER FIELDS
// ============================================================================

pub const VARFILTER_MEMBERS: &str = "VARFILTER_MEMBERS";
pub const VARFILTER_VARIABLE: &str = "VARFILTER_VARIABLE";
pub const VARFILTER_OP: &str = "VARFILTER_OP";
pub const VARFILTER_VALUE: &str = "VARFILTER_VALUE";

pub const GEOLENFILTER_OP: &str = "GEOLENFILTER_OP";
pub const GEOLENFILTER_VALUE: &str = "GEOLENFILTER_VALUE";

pub const TRAJECTORYVALUES_MEMBERS: &str = "TRAJECTORYVALUES_MEMBERS";
pub const TRAJECTORYVALUES_VARIABLE: &str = "TRAJECTORYVALUES_VARIABLE";
pub const TRAJECTORYVALUES_THICKNESSVAR: &str = "TRAJECTORYVALUES_THICKNESSVAR";

// ============================================================================
// INPUT PREFIXES
// ============================================================================

/// Prefix under which a filter stage finds the line geometry it filters.
pub const LINES_PREFIX: &str = "LINES_";

/// Prefix under which the variable filter finds its per-vertex values.
pub const VARFILTER_PREFIX: &str = "VARFILTER_";

/// Prefix under which the value source finds the lines it samples.
pub const TRAJECTORYVALUES_PREFIX: &str = "TRAJECTORYVALUES_";

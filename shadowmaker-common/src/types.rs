use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Side length of one Gridfinity cell in millimeters
pub const GRID_CELL_MM: f64 = 42.0;

/// Millimeters per inch
pub const MM_PER_INCH: f64 = 25.4;

/// Unit the reference token diameter is measured in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LengthUnit {
    /// Token diameter given in inches (the classic 2.000" token)
    #[default]
    Inches,
    /// Token diameter given in millimeters
    Millimeters,
}

impl LengthUnit {
    /// Multiplier converting a length in this unit to millimeters
    pub fn mm_per_unit(&self) -> f64 {
        match self {
            LengthUnit::Inches => MM_PER_INCH,
            LengthUnit::Millimeters => 1.0,
        }
    }

    pub fn to_mm(&self, value: f64) -> f64 {
        value * self.mm_per_unit()
    }
}

impl fmt::Display for LengthUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LengthUnit::Inches => write!(f, "in"),
            LengthUnit::Millimeters => write!(f, "mm"),
        }
    }
}

impl FromStr for LengthUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "in" | "inch" | "inches" => Ok(LengthUnit::Inches),
            "mm" | "millimeter" | "millimeters" => Ok(LengthUnit::Millimeters),
            other => Err(format!("unknown length unit '{}'", other)),
        }
    }
}

/// 2D point in millimeters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point2DMm {
    pub x: f64,
    pub y: f64,
}

impl Point2DMm {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Contour represented as a sequence of points in millimeters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contour {
    pub points: Vec<Point2DMm>,
    /// Whether the contour is closed
    pub closed: bool,
}

impl Contour {
    /// Build a closed contour, repeating the first point at the end
    /// when the sequence does not already end where it starts.
    pub fn closed_from(mut points: Vec<Point2DMm>) -> Self {
        if let (Some(first), Some(last)) = (points.first().copied(), points.last().copied()) {
            if first != last {
                points.push(first);
            }
        }

        Self {
            points,
            closed: true,
        }
    }

    /// Whether the last point repeats the first one
    pub fn is_explicitly_closed(&self) -> bool {
        match (self.points.first(), self.points.last()) {
            (Some(first), Some(last)) => self.points.len() > 1 && first == last,
            _ => false,
        }
    }
}

/// Tray footprint in Gridfinity cells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridSize {
    pub x: u32,
    pub y: u32,
}

impl GridSize {
    /// Number of cells needed to hold the given extents (in mm).
    /// Never less than one cell per axis.
    pub fn from_extent_mm(width_mm: f64, height_mm: f64) -> Self {
        Self {
            x: cells_for(width_mm),
            y: cells_for(height_mm),
        }
    }
}

fn cells_for(extent_mm: f64) -> u32 {
    if !extent_mm.is_finite() || extent_mm <= 0.0 {
        return 1;
    }
    ((extent_mm / GRID_CELL_MM).ceil() as u32).max(1)
}

impl fmt::Display for GridSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{}", self.x, self.y)
    }
}

/// Where a split-mode piece sits relative to the center of the whole layout, in mm
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct PlacementOffset {
    pub x: f64,
    pub y: f64,
}

impl From<[f64; 2]> for PlacementOffset {
    fn from([x, y]: [f64; 2]) -> Self {
        Self { x, y }
    }
}

impl From<PlacementOffset> for [f64; 2] {
    fn from(offset: PlacementOffset) -> Self {
        [offset.x, offset.y]
    }
}

/// How traced contours are written out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OutputMode {
    /// All contours in a single DXF file
    #[default]
    Combined,
    /// One DXF file per contour
    Split,
}

impl OutputMode {
    pub fn is_split(&self) -> bool {
        matches!(self, OutputMode::Split)
    }
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputMode::Combined => write!(f, "combined"),
            OutputMode::Split => write!(f, "split"),
        }
    }
}

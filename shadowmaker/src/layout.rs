// Pixel to millimeter layout
// Scales traced outlines, centers them and sizes the tray around them

use shadowmaker_common::{Contour, GridSize, PlacementOffset, Point2DMm};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::outline::{Bounds, Outline};

/// Millimeters per pixel, fixed for one image once the token is measured
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleFactor(f64);

impl ScaleFactor {
    /// Scale that makes the measured token diameter equal its physical size.
    pub fn from_reference(token_diameter_mm: f64, reference_diameter_px: f64) -> Option<Self> {
        let scale = token_diameter_mm / reference_diameter_px;
        (scale.is_finite() && scale > 0.0).then_some(Self(scale))
    }

    pub fn mm_per_px(&self) -> f64 {
        self.0
    }

    pub fn to_mm(&self, px: f64) -> f64 {
        px * self.0
    }
}

/// Retained outlines placed in physical space
#[derive(Debug, Clone)]
pub struct Layout {
    pub scale: ScaleFactor,
    /// Pixel bounding box of all retained outlines
    pub bounds: Bounds,
    pub grid: GridSize,
    /// All outlines centered on the shared bounding-box center
    pub contours: Vec<Contour>,
    /// Each outline centered on its own bounding-box center, for split output
    pub pieces: Vec<Contour>,
    /// Where each piece sits relative to the shared center
    pub offsets: Vec<PlacementOffset>,
}

/// Drop outlines whose enclosed area is below `min_area` pixels.
pub fn filter_small(outlines: Vec<Outline>, min_area: f64) -> Result<Vec<Outline>> {
    let before = outlines.len();
    let kept: Vec<Outline> = outlines.into_iter().filter(|o| o.area() >= min_area).collect();
    debug!("area filter kept {} of {} outline(s)", kept.len(), before);

    if kept.is_empty() {
        return Err(PipelineError::NoContoursAfterFilter { min_area });
    }
    Ok(kept)
}

/// Map a pixel point to DXF space. Rows become X and columns become Y,
/// both measured from `center` and scaled to millimeters.
pub fn to_drawing(point: (f64, f64), center: (f64, f64), scale: ScaleFactor) -> Point2DMm {
    let (col, row) = point;
    let (center_col, center_row) = center;
    Point2DMm::new(scale.to_mm(row - center_row), scale.to_mm(col - center_col))
}

fn place(outline: &Outline, center: (f64, f64), scale: ScaleFactor) -> Contour {
    Contour::closed_from(
        outline
            .points
            .iter()
            .map(|p| to_drawing((p.x as f64, p.y as f64), center, scale))
            .collect(),
    )
}

/// Tray cells needed for the pixel bounding box at this scale.
/// Rows run along the tray's X axis, matching [`to_drawing`].
pub fn grid_size(bounds: &Bounds, scale: ScaleFactor) -> GridSize {
    GridSize::from_extent_mm(scale.to_mm(bounds.height()), scale.to_mm(bounds.width()))
}

impl Layout {
    /// Place the outlines. The grid is computed from exactly these outlines.
    pub fn new(outlines: &[Outline], scale: ScaleFactor) -> Result<Self> {
        let bounds = Bounds::of_outlines(outlines).ok_or(PipelineError::NoOutlines)?;
        let center = bounds.center();
        let grid = grid_size(&bounds, scale);

        let contours = outlines.iter().map(|o| place(o, center, scale)).collect();

        let mut pieces = Vec::with_capacity(outlines.len());
        let mut offsets = Vec::with_capacity(outlines.len());
        for outline in outlines {
            // Non-empty outlines only reach here, so every piece has bounds.
            let own_center = outline.bounds().map(|b| b.center()).unwrap_or(center);
            pieces.push(place(outline, own_center, scale));

            let offset = to_drawing(own_center, center, scale);
            offsets.push(PlacementOffset {
                x: round_tenth(offset.x),
                y: round_tenth(offset.y),
            });
        }

        debug!(
            grid = %grid,
            width_mm = scale.to_mm(bounds.height()),
            height_mm = scale.to_mm(bounds.width()),
            "laid out {} contour(s)",
            outlines.len()
        );

        Ok(Self {
            scale,
            bounds,
            grid,
            contours,
            pieces,
            offsets,
        })
    }
}

fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

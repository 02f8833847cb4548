// Reference token detection
// Picks the most circular outline as the token of known diameter

use std::f64::consts::PI;

use tracing::debug;

use crate::outline::{Circle, Outline};

/// The outline judged to be the reference token
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferenceShape {
    /// Index into the outline slice it was found in
    pub index: usize,
    /// Circularity score, 1.0 for a perfect circle
    pub score: f64,
    /// Minimum enclosing circle of the outline
    pub circle: Circle,
}

impl ReferenceShape {
    pub fn diameter_px(&self) -> f64 {
        self.circle.diameter()
    }
}

/// Circularity (4π·area / perimeter²) of an outline.
/// Returns `None` for outlines that cannot be scored: zero perimeter,
/// zero enclosing diameter, or a score that is not a positive finite number.
pub fn circularity(outline: &Outline) -> Option<(f64, Circle)> {
    let perimeter = outline.perimeter();
    if perimeter <= 0.0 {
        return None;
    }

    let circle = outline.enclosing_circle()?;
    if circle.diameter() <= 0.0 {
        return None;
    }

    let score = 4.0 * PI * outline.area() / (perimeter * perimeter);
    (score.is_finite() && score > 0.0).then_some((score, circle))
}

/// Find the most circular outline. Ties keep the earliest outline.
pub fn find_reference(outlines: &[Outline]) -> Option<ReferenceShape> {
    let mut best: Option<ReferenceShape> = None;

    for (index, outline) in outlines.iter().enumerate() {
        let Some((score, circle)) = circularity(outline) else {
            continue;
        };

        if best.map_or(true, |b| score > b.score) {
            best = Some(ReferenceShape {
                index,
                score,
                circle,
            });
        }
    }

    if let Some(shape) = &best {
        debug!(
            index = shape.index,
            score = shape.score,
            diameter_px = shape.diameter_px(),
            "reference token candidate among {} outline(s)",
            outlines.len()
        );
    }

    best
}

/// All outlines except the one at `exclude`
pub fn without_reference(outlines: Vec<Outline>, exclude: Option<usize>) -> Vec<Outline> {
    outlines
        .into_iter()
        .enumerate()
        .filter(|(i, _)| Some(*i) != exclude)
        .map(|(_, o)| o)
        .collect()
}

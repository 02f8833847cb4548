// Boundary growth and simplification
// Dilates the traced mask by the marker-pen offset and simplifies the resulting outlines

use image::GrayImage;
use imageproc::distance_transform::Norm;
use imageproc::geometry::approximate_polygon_dp;
use imageproc::morphology::dilate;
use tracing::{debug, info, warn};

use crate::config::TraceSettings;
use crate::detection::{find_reference, without_reference, ReferenceShape};
use crate::outline::Outline;
use crate::segmentation::extract_outlines;

/// Dilation kernel size in pixels and the simplification tolerance it implies
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrowthParams {
    /// Diameter of the dilation kernel, in pixels
    pub kernel_size: u32,
    /// Douglas-Peucker tolerance, in pixels
    pub epsilon: f64,
}

impl GrowthParams {
    /// kernel = ceil(diameter / (token / offset) × 2), epsilon = kernel / resolution.
    /// Token and offset only enter as a ratio, so their unit does not matter.
    pub fn from_settings(reference_diameter_px: f64, settings: &TraceSettings) -> Self {
        let kernel_size = if settings.offset > 0.0 && settings.token > 0.0 {
            let raw = (reference_diameter_px / (settings.token / settings.offset) * 2.0).ceil();
            if raw.is_finite() && raw > 0.0 {
                raw as u32
            } else {
                0
            }
        } else {
            0
        };

        let epsilon = if settings.resolution > 0.0 {
            kernel_size as f64 / settings.resolution
        } else {
            0.0
        };

        Self { kernel_size, epsilon }
    }

    /// Radius of the L2 disk that matches the kernel size
    pub fn dilation_radius(&self) -> u8 {
        (self.kernel_size / 2).min(u8::MAX as u32) as u8
    }
}

/// Outcome of growing the mask
#[derive(Debug, Clone)]
pub struct GrowthResult {
    pub params: GrowthParams,
    pub dilated: GrayImage,
    /// Simplified outlines with the reference token removed
    pub outlines: Vec<Outline>,
    /// The token as re-detected on the dilated mask
    pub reference: Option<ReferenceShape>,
    /// Reference outline on the dilated mask, kept for debug overlays
    pub reference_outline: Option<Outline>,
}

/// Grow the mask by the pen offset, trace it again and drop the token.
pub fn grow(mask: &GrayImage, reference_diameter_px: f64, settings: &TraceSettings) -> GrowthResult {
    let params = GrowthParams::from_settings(reference_diameter_px, settings);
    let radius = params.dilation_radius();

    info!(
        kernel_size = params.kernel_size,
        epsilon = params.epsilon,
        "growing outlines by {} px",
        radius
    );

    let dilated = if radius > 0 {
        dilate(mask, Norm::L2, radius)
    } else {
        mask.clone()
    };

    let simplified: Vec<Outline> = extract_outlines(&dilated)
        .iter()
        .map(|o| simplify(o, params.epsilon))
        .collect();

    // Dilation changes every shape, so the token is looked up again.
    let reference = find_reference(&simplified);
    if reference.is_none() {
        warn!("no reference token after growth; keeping all {} outline(s)", simplified.len());
    }

    let reference_outline = reference.map(|r| simplified[r.index].clone());
    let outlines = without_reference(simplified, reference.map(|r| r.index));
    debug!("{} outline(s) after removing the token", outlines.len());

    GrowthResult {
        params,
        dilated,
        outlines,
        reference,
        reference_outline,
    }
}

/// Douglas-Peucker simplification of a closed outline
pub fn simplify(outline: &Outline, epsilon: f64) -> Outline {
    if epsilon <= 0.0 || outline.len() < 3 {
        return outline.clone();
    }
    Outline::new(approximate_polygon_dp(&outline.points, epsilon, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segmentation::segment_gray;
    use image::Luma;
    use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut};
    use imageproc::point::Point;
    use imageproc::rect::Rect;

    #[test]
    fn test_kernel_size_formula() {
        let settings = TraceSettings {
            token: 2.0,
            offset: 0.1,
            resolution: 10.0,
            ..TraceSettings::default()
        };
        // 200 / (2.0 / 0.1) * 2 = 20
        let params = GrowthParams::from_settings(200.0, &settings);
        assert_eq!(params.kernel_size, 20);
        assert_eq!(params.epsilon, 2.0);
        assert_eq!(params.dilation_radius(), 10);

        // ceil(2.05) = 3
        let params = GrowthParams::from_settings(20.5, &settings);
        assert_eq!(params.kernel_size, 3);
    }

    #[test]
    fn test_zero_offset_means_no_growth() {
        let settings = TraceSettings {
            offset: 0.0,
            ..TraceSettings::default()
        };
        let params = GrowthParams::from_settings(500.0, &settings);
        assert_eq!(params.kernel_size, 0);
        assert_eq!(params.epsilon, 0.0);
    }

    #[test]
    fn test_huge_kernel_radius_saturates() {
        let settings = TraceSettings {
            token: 1.0,
            offset: 1.0,
            ..TraceSettings::default()
        };
        let params = GrowthParams::from_settings(4000.0, &settings);
        assert_eq!(params.dilation_radius(), u8::MAX);
    }

    #[test]
    fn test_simplify_straightens_square_border() {
        let mut points = Vec::new();
        for x in 0..20 {
            points.push(Point::new(x, 0));
        }
        for y in 0..20 {
            points.push(Point::new(20, y));
        }
        for x in (1..=20).rev() {
            points.push(Point::new(x, 20));
        }
        for y in (1..=20).rev() {
            points.push(Point::new(0, y));
        }

        let simplified = simplify(&Outline::new(points), 1.0);
        assert!(simplified.len() <= 5, "{} points", simplified.len());
        assert!((simplified.area() - 400.0).abs() < 1e-9);
    }

    #[test]
    fn test_grow_excludes_token_and_enlarges_object() {
        let mut img = GrayImage::from_pixel(400, 240, Luma([235u8]));
        draw_filled_circle_mut(&mut img, (80, 120), 50, Luma([15u8]));
        draw_filled_rect_mut(&mut img, Rect::at(200, 60).of_size(150, 110), Luma([15u8]));

        let mask = segment_gray(&img, 110).unwrap();
        let settings = TraceSettings::default();
        let result = grow(&mask, 100.0, &settings);

        assert_eq!(result.params.kernel_size, 10);
        assert!(result.reference.is_some());
        assert_eq!(result.outlines.len(), 1);

        let bounds = result.outlines[0].bounds().unwrap();
        assert!(bounds.min_x < 200 && bounds.max_x > 349);
        assert!(bounds.min_y < 60 && bounds.max_y > 169);
        assert!(result.outlines[0].len() < 20);
    }
}

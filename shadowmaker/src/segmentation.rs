// Object segmentation module
// Binarizes the photo so the marker ink and the token become foreground

use image::{DynamicImage, GrayImage};
use imageproc::contours::find_contours;
use imageproc::contrast::{threshold, ThresholdType};
use imageproc::distance_transform::Norm;
use imageproc::morphology::open;
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::outline::Outline;

/// Radius of the disk used to knock out speckles (a 5×5 ellipse)
const SPECKLE_RADIUS: u8 = 2;

/// Turn a photo into a binary mask: dark marks on light paper become white (255),
/// everything else black. Isolated specks smaller than the opening disk are removed.
pub fn segment(image: &DynamicImage, threshold_level: u8) -> Result<GrayImage> {
    if image.width() == 0 || image.height() == 0 {
        return Err(PipelineError::EmptyImage);
    }

    let gray = image.to_luma8();
    segment_gray(&gray, threshold_level)
}

pub fn segment_gray(gray: &GrayImage, threshold_level: u8) -> Result<GrayImage> {
    if gray.width() == 0 || gray.height() == 0 {
        return Err(PipelineError::EmptyImage);
    }

    // Brighter than the threshold is paper; inverting makes the ink the foreground.
    let binary = threshold(gray, threshold_level, ThresholdType::BinaryInverted);
    let mask = open(&binary, Norm::L2, SPECKLE_RADIUS);

    debug!(
        width = mask.width(),
        height = mask.height(),
        foreground = foreground_pixels(&mask),
        "segmented image at threshold {}",
        threshold_level
    );

    Ok(mask)
}

/// Every border in the mask, outer borders and holes alike
pub fn extract_outlines(mask: &GrayImage) -> Vec<Outline> {
    find_contours::<i32>(mask)
        .into_iter()
        .filter(|c| !c.points.is_empty())
        .map(|c| Outline::new(c.points))
        .collect()
}

fn foreground_pixels(mask: &GrayImage) -> usize {
    mask.pixels().filter(|p| p[0] > 0).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut};
    use imageproc::rect::Rect;

    fn paper(width: u32, height: u32) -> GrayImage {
        GrayImage::from_pixel(width, height, Luma([230u8]))
    }

    #[test]
    fn test_dark_marks_become_foreground() {
        let mut img = paper(80, 60);
        draw_filled_rect_mut(&mut img, Rect::at(20, 10).of_size(30, 20), Luma([20u8]));

        let mask = segment_gray(&img, 110).unwrap();
        assert_eq!(mask.get_pixel(35, 20)[0], 255);
        assert_eq!(mask.get_pixel(5, 5)[0], 0);
    }

    #[test]
    fn test_opening_removes_speckles() {
        let mut img = paper(60, 60);
        img.put_pixel(10, 10, Luma([0u8]));
        img.put_pixel(11, 10, Luma([0u8]));
        draw_filled_circle_mut(&mut img, (40, 40), 8, Luma([0u8]));

        let mask = segment_gray(&img, 110).unwrap();
        assert_eq!(mask.get_pixel(10, 10)[0], 0);
        assert_eq!(mask.get_pixel(40, 40)[0], 255);
    }

    #[test]
    fn test_empty_image_is_rejected() {
        let img = DynamicImage::new_luma8(0, 0);
        assert!(matches!(segment(&img, 100), Err(PipelineError::EmptyImage)));
    }

    #[test]
    fn test_extract_outlines_finds_each_blob() {
        let mut img = paper(120, 60);
        draw_filled_circle_mut(&mut img, (30, 30), 12, Luma([0u8]));
        draw_filled_rect_mut(&mut img, Rect::at(70, 15).of_size(30, 30), Luma([0u8]));

        let mask = segment_gray(&img, 110).unwrap();
        let outlines = extract_outlines(&mask);
        assert_eq!(outlines.len(), 2);
    }
}

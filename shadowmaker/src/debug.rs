// Debug visualizations
// Saves the intermediate mask, an annotated copy of the photo and found chessboard corners

use std::fs;
use std::path::{Path, PathBuf};

use image::{DynamicImage, GrayImage, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_hollow_circle_mut, draw_line_segment_mut};
use nalgebra::Point2;
use tracing::info;

use crate::chessboard::BoardSize;
use crate::detection::ReferenceShape;
use crate::error::{PipelineError, Result};
use crate::outline::Outline;

const OUTLINE_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const TOKEN_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const GROWN_TOKEN_COLOR: Rgb<u8> = Rgb([255, 160, 0]);
/// Chessboard rows cycle through these, first corner of each row ringed
const ROW_COLORS: [Rgb<u8>; 6] = [
    Rgb([255, 0, 0]),
    Rgb([255, 128, 0]),
    Rgb([200, 200, 0]),
    Rgb([0, 200, 0]),
    Rgb([0, 160, 255]),
    Rgb([160, 0, 255]),
];

fn save(image: &DynamicImage, path: &Path) -> Result<()> {
    image.save(path).map_err(|source| PipelineError::ImageSave {
        path: path.to_path_buf(),
        source,
    })?;
    info!("saved debug image {}", path.display());
    Ok(())
}

/// Draw an outline as a closed chain of segments
pub fn draw_outline(img: &mut RgbImage, outline: &Outline, color: Rgb<u8>) {
    if outline.is_empty() {
        return;
    }
    let n = outline.points.len();
    for i in 0..n {
        let a = outline.points[i];
        let b = outline.points[(i + 1) % n];
        draw_line_segment_mut(img, (a.x as f32, a.y as f32), (b.x as f32, b.y as f32), color);
    }
}

/// Photo with the retained outlines in green, the token circle in red
/// and the grown token outline in orange
pub fn annotate(
    photo: &RgbImage,
    outlines: &[Outline],
    reference: Option<&ReferenceShape>,
    grown_token: Option<&Outline>,
) -> RgbImage {
    let mut img = photo.clone();

    for outline in outlines {
        draw_outline(&mut img, outline, OUTLINE_COLOR);
    }

    if let Some(reference) = reference {
        let (cx, cy) = reference.circle.center;
        let center = (cx.round() as i32, cy.round() as i32);
        let radius = reference.circle.radius.round() as i32;
        // Two rings so the circle stays visible on large photos
        draw_hollow_circle_mut(&mut img, center, radius, TOKEN_COLOR);
        draw_hollow_circle_mut(&mut img, center, radius + 1, TOKEN_COLOR);
        draw_filled_circle_mut(&mut img, center, 4, TOKEN_COLOR);
    }

    if let Some(token) = grown_token {
        draw_outline(&mut img, token, GROWN_TOKEN_COLOR);
    }

    img
}

/// Write `<name>_mask.png` and `<name>_overlay.png` into `out_dir`.
pub fn save_debug_images(
    out_dir: &Path,
    name: &str,
    mask: &GrayImage,
    photo: &RgbImage,
    outlines: &[Outline],
    reference: Option<&ReferenceShape>,
    grown_token: Option<&Outline>,
) -> Result<Vec<PathBuf>> {
    let mask_path = out_dir.join(format!("{}_mask.png", name));
    save(&DynamicImage::ImageLuma8(mask.clone()), &mask_path)?;

    let overlay_path = out_dir.join(format!("{}_overlay.png", name));
    let overlay = annotate(photo, outlines, reference, grown_token);
    save(&DynamicImage::ImageRgb8(overlay), &overlay_path)?;

    Ok(vec![mask_path, overlay_path])
}

/// Photo with the detected chessboard corners joined row by row
pub fn annotate_corners(photo: &GrayImage, corners: &[Point2<f64>], size: BoardSize) -> RgbImage {
    let mut img = DynamicImage::ImageLuma8(photo.clone()).to_rgb8();
    let cols = size.cols.max(1) as usize;

    for (row, line) in corners.chunks(cols).enumerate() {
        let color = ROW_COLORS[row % ROW_COLORS.len()];
        for pair in line.windows(2) {
            draw_line_segment_mut(
                &mut img,
                (pair[0].x as f32, pair[0].y as f32),
                (pair[1].x as f32, pair[1].y as f32),
                color,
            );
        }
        for (i, p) in line.iter().enumerate() {
            let center = (p.x.round() as i32, p.y.round() as i32);
            draw_hollow_circle_mut(&mut img, center, 4, color);
            if i == 0 {
                draw_hollow_circle_mut(&mut img, center, 7, color);
            }
        }
    }
    img
}

/// Write `<photo stem>_corners.png` into `out_dir`.
pub fn save_corner_image(
    out_dir: &Path,
    photo_path: &Path,
    photo: &GrayImage,
    corners: &[Point2<f64>],
    size: BoardSize,
) -> Result<PathBuf> {
    fs::create_dir_all(out_dir).map_err(|e| PipelineError::io(out_dir, e))?;
    let stem = photo_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "board".to_string());
    let path = out_dir.join(format!("{}_corners.png", stem));
    save(&DynamicImage::ImageRgb8(annotate_corners(photo, corners, size)), &path)?;
    Ok(path)
}

// Lens undistortion module
// Removes radial and tangential lens distortion from raw photos before tracing

use std::fs;
use std::path::Path;

use image::imageops;
use image::{Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_with, Interpolation};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{PipelineError, Result};

/// Border points sampled per side when sizing the undistorted view
const BORDER_SAMPLES: usize = 9;
/// Fixed-point iterations when inverting the distortion model
const UNDISTORT_ITERATIONS: usize = 20;
/// Slack when snapping the valid region to whole pixels
const PIXEL_EPS: f64 = 1e-6;

/// Intrinsics and Brown-Conrady coefficients of one camera.
///
/// Stored as JSON:
/// `{"camera_matrix": [[fx, 0, cx], [0, fy, cy], [0, 0, 1]], "distortion_coefficients": [k1, k2, p1, p2, k3]}`.
/// Fewer than five coefficients are padded with zeros.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraCalibration {
    pub camera_matrix: [[f64; 3]; 3],
    pub distortion_coefficients: Vec<f64>,
    /// RMS reprojection error in pixels, when the file came from `calibrate`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reprojection_error: Option<f64>,
}

/// Validated pinhole plus distortion model
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
}

/// Camera matrix of an undistorted image, without skew
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pinhole {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

/// Pixel rectangle of the undistorted image where every pixel has a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CameraCalibration {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        let calibration: Self = serde_json::from_str(&text).map_err(|source| PipelineError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        calibration.intrinsics()?;
        debug!("loaded camera calibration from {}", path.display());
        Ok(calibration)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(|source| PipelineError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| PipelineError::io(dir, e))?;
        }
        fs::write(path, json).map_err(|e| PipelineError::io(path, e))?;
        info!("saved camera calibration to {}", path.display());
        Ok(())
    }

    pub(crate) fn intrinsics(&self) -> Result<Intrinsics> {
        let m = &self.camera_matrix;
        let (fx, fy, cx, cy) = (m[0][0], m[1][1], m[0][2], m[1][2]);

        if !(fx.is_finite() && fy.is_finite() && fx > 0.0 && fy > 0.0) {
            return Err(PipelineError::Calibration(format!(
                "focal lengths must be positive, got fx={} fy={}",
                fx, fy
            )));
        }
        if !(cx.is_finite() && cy.is_finite()) {
            return Err(PipelineError::Calibration("principal point is not finite".into()));
        }
        if self.distortion_coefficients.len() > 5 {
            return Err(PipelineError::Calibration(format!(
                "expected at most 5 distortion coefficients, got {}",
                self.distortion_coefficients.len()
            )));
        }
        if self.distortion_coefficients.iter().any(|c| !c.is_finite()) {
            return Err(PipelineError::Calibration("distortion coefficients must be finite".into()));
        }

        let coeff = |i: usize| self.distortion_coefficients.get(i).copied().unwrap_or(0.0);
        Ok(Intrinsics {
            fx,
            fy,
            cx,
            cy,
            k1: coeff(0),
            k2: coeff(1),
            p1: coeff(2),
            p2: coeff(3),
            k3: coeff(4),
        })
    }
}

impl Intrinsics {
    pub(crate) fn to_calibration(self, reprojection_error: Option<f64>) -> CameraCalibration {
        CameraCalibration {
            camera_matrix: [[self.fx, 0.0, self.cx], [0.0, self.fy, self.cy], [0.0, 0.0, 1.0]],
            distortion_coefficients: vec![self.k1, self.k2, self.p1, self.p2, self.k3],
            reprojection_error,
        }
    }

    /// Apply the lens model to ideal normalized image coordinates.
    pub(crate) fn distort_normalized(&self, x: f64, y: f64) -> (f64, f64) {
        let r2 = x * x + y * y;
        let radial = 1.0 + self.k1 * r2 + self.k2 * r2 * r2 + self.k3 * r2 * r2 * r2;
        let xd = x * radial + 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let yd = y * radial + self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
        (xd, yd)
    }

    /// Invert [`Intrinsics::distort_normalized`] by fixed-point iteration.
    fn undistort_normalized(&self, xd: f64, yd: f64) -> (f64, f64) {
        let (mut x, mut y) = (xd, yd);
        for _ in 0..UNDISTORT_ITERATIONS {
            let r2 = x * x + y * y;
            let radial = 1.0 + self.k1 * r2 + self.k2 * r2 * r2 + self.k3 * r2 * r2 * r2;
            if !(radial.is_finite() && radial > 0.0) {
                break;
            }
            let dx = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
            let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
            x = (xd - dx) / radial;
            y = (yd - dy) / radial;
        }
        (x, y)
    }

    /// Where an ideal pinhole pixel `(u, v)` of this camera lands in the distorted photo.
    #[cfg(test)]
    fn distort(&self, u: f64, v: f64) -> (f64, f64) {
        let (xd, yd) = self.distort_normalized((u - self.cx) / self.fx, (v - self.cy) / self.fy);
        (xd * self.fx + self.cx, yd * self.fy + self.cy)
    }
}

/// Bounds in normalized coordinates: `[x0, y0, x1, y1]`
type NormalizedRect = [f64; 4];

/// Undistorted extent of the photo border: the box holding every source pixel
/// and the largest box holding only source pixels.
fn border_rects(intrinsics: &Intrinsics, width: u32, height: u32) -> (NormalizedRect, NormalizedRect) {
    let (w, h) = ((width - 1) as f64, (height - 1) as f64);
    let last = BORDER_SAMPLES - 1;
    let mut outer = [f64::MAX, f64::MAX, f64::MIN, f64::MIN];
    let mut inner = [f64::MIN, f64::MIN, f64::MAX, f64::MAX];

    for j in 0..BORDER_SAMPLES {
        for i in 0..BORDER_SAMPLES {
            let u = i as f64 * w / last as f64;
            let v = j as f64 * h / last as f64;
            let (x, y) =
                intrinsics.undistort_normalized((u - intrinsics.cx) / intrinsics.fx, (v - intrinsics.cy) / intrinsics.fy);

            outer = [outer[0].min(x), outer[1].min(y), outer[2].max(x), outer[3].max(y)];
            if i == 0 {
                inner[0] = inner[0].max(x);
            }
            if i == last {
                inner[2] = inner[2].min(x);
            }
            if j == 0 {
                inner[1] = inner[1].max(y);
            }
            if j == last {
                inner[3] = inner[3].min(y);
            }
        }
    }
    (outer, inner)
}

/// Camera matrix for the undistorted image that keeps every source pixel in view
/// (free scaling 1), and the region of it where all pixels are valid.
pub fn optimal_new_camera(calibration: &CameraCalibration, width: u32, height: u32) -> Result<(Pinhole, Roi)> {
    if width < 2 || height < 2 {
        return Err(PipelineError::EmptyImage);
    }
    let intrinsics = calibration.intrinsics()?;
    let (outer, inner) = border_rects(&intrinsics, width, height);

    let (w, h) = ((width - 1) as f64, (height - 1) as f64);
    let (span_x, span_y) = (outer[2] - outer[0], outer[3] - outer[1]);
    if !(span_x.is_finite() && span_y.is_finite() && span_x > 0.0 && span_y > 0.0) {
        return Err(PipelineError::Calibration(
            "distortion model folds the image border; cannot undistort".into(),
        ));
    }

    let fx = w / span_x;
    let fy = h / span_y;
    let pinhole = Pinhole {
        fx,
        fy,
        cx: -fx * outer[0],
        cy: -fy * outer[1],
    };

    let to_px = |v: f64, f: f64, c: f64| v * f + c;
    let x0 = (to_px(inner[0], fx, pinhole.cx) - PIXEL_EPS).ceil().max(0.0);
    let y0 = (to_px(inner[1], fy, pinhole.cy) - PIXEL_EPS).ceil().max(0.0);
    let x1 = (to_px(inner[2], fx, pinhole.cx) + PIXEL_EPS).floor().min(w);
    let y1 = (to_px(inner[3], fy, pinhole.cy) + PIXEL_EPS).floor().min(h);
    if !(x1 >= x0 && y1 >= y0) {
        return Err(PipelineError::Calibration(
            "no pixel of the undistorted image maps inside the photo".into(),
        ));
    }

    let roi = Roi {
        x: x0 as u32,
        y: y0 as u32,
        width: (x1 - x0) as u32 + 1,
        height: (y1 - y0) as u32 + 1,
    };
    Ok((pinhole, roi))
}

/// Remap `image` so straight lines in the scene are straight in the output.
/// The new view keeps every source pixel, then is cropped to the region
/// where no pixel falls outside the photo.
pub fn undistort(image: &RgbImage, calibration: &CameraCalibration) -> Result<RgbImage> {
    let intrinsics = calibration.intrinsics()?;
    let (pinhole, roi) = optimal_new_camera(calibration, image.width(), image.height())?;
    info!(
        fx = intrinsics.fx,
        fy = intrinsics.fy,
        k1 = intrinsics.k1,
        new_fx = pinhole.fx,
        new_fy = pinhole.fy,
        "undistorting {}x{} image",
        image.width(),
        image.height()
    );

    let mapping = move |u: f32, v: f32| {
        let x = (u as f64 - pinhole.cx) / pinhole.fx;
        let y = (v as f64 - pinhole.cy) / pinhole.fy;
        let (xd, yd) = intrinsics.distort_normalized(x, y);
        (
            (xd * intrinsics.fx + intrinsics.cx) as f32,
            (yd * intrinsics.fy + intrinsics.cy) as f32,
        )
    };

    let remapped = warp_with(image, mapping, Interpolation::Bilinear, Rgb([0, 0, 0]));
    debug!(x = roi.x, y = roi.y, width = roi.width, height = roi.height, "cropping to valid region");
    Ok(imageops::crop_imm(&remapped, roi.x, roi.y, roi.width, roi.height).to_image())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn calibration(coefficients: Vec<f64>) -> CameraCalibration {
        CameraCalibration {
            camera_matrix: [[500.0, 0.0, 32.0], [0.0, 500.0, 24.0], [0.0, 0.0, 1.0]],
            distortion_coefficients: coefficients,
            reprojection_error: None,
        }
    }

    #[test]
    fn test_zero_distortion_is_identity() {
        let image = RgbImage::from_fn(64, 48, |x, y| Rgb([(x * 4) as u8, (y * 5) as u8, 128]));
        let out = undistort(&image, &calibration(vec![0.0; 5])).unwrap();

        assert_eq!(out.dimensions(), image.dimensions());
        for y in 1..47 {
            for x in 1..63 {
                let a = image.get_pixel(x, y);
                let b = out.get_pixel(x, y);
                for c in 0..3 {
                    assert!((a[c] as i32 - b[c] as i32).abs() <= 1, "pixel ({}, {}) moved", x, y);
                }
            }
        }
    }

    #[test]
    fn test_zero_distortion_keeps_camera_matrix() {
        let (pinhole, roi) = optimal_new_camera(&calibration(vec![]), 64, 48).unwrap();
        assert_relative_eq!(pinhole.fx, 500.0, max_relative = 1e-9);
        assert_relative_eq!(pinhole.fy, 500.0, max_relative = 1e-9);
        assert_relative_eq!(pinhole.cx, 32.0, epsilon = 1e-9);
        assert_relative_eq!(pinhole.cy, 24.0, epsilon = 1e-9);
        assert_eq!(
            roi,
            Roi {
                x: 0,
                y: 0,
                width: 64,
                height: 48
            }
        );
    }

    #[test]
    fn test_barrel_view_zooms_out_and_crops() {
        let camera = CameraCalibration {
            camera_matrix: [[400.0, 0.0, 320.0], [0.0, 400.0, 240.0], [0.0, 0.0, 1.0]],
            distortion_coefficients: vec![-0.25, 0.05],
            reprojection_error: None,
        };
        let (pinhole, roi) = optimal_new_camera(&camera, 641, 481).unwrap();

        // Every source pixel stays in view, so the new focal length is shorter.
        assert!(pinhole.fx < 400.0);
        assert!(pinhole.fy < 400.0);
        assert!(roi.width < 641 && roi.height < 481);
        assert!(roi.x > 0 && roi.y > 0);

        let photo = RgbImage::from_pixel(641, 481, Rgb([200, 180, 160]));
        let out = undistort(&photo, &camera).unwrap();
        assert_eq!(out.dimensions(), (roi.width, roi.height));
        for y in 2..out.height() - 2 {
            for x in 2..out.width() - 2 {
                assert_ne!(*out.get_pixel(x, y), Rgb([0, 0, 0]), "pixel ({}, {}) has no source", x, y);
            }
        }
    }

    #[test]
    fn test_undistort_inverts_distort() {
        let intrinsics = calibration(vec![-0.2, 0.03, 0.001, -0.002, 0.0]).intrinsics().unwrap();
        for &(x, y) in &[(0.0, 0.0), (0.3, -0.2), (-0.5, 0.4), (0.6, 0.45)] {
            let (xd, yd) = intrinsics.distort_normalized(x, y);
            let (xu, yu) = intrinsics.undistort_normalized(xd, yd);
            assert_relative_eq!(xu, x, epsilon = 1e-6);
            assert_relative_eq!(yu, y, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_principal_point_is_fixed() {
        let intrinsics = calibration(vec![0.3, -0.1, 0.01, 0.02, 0.05]).intrinsics().unwrap();
        let (x, y) = intrinsics.distort(32.0, 24.0);
        assert_relative_eq!(x, 32.0);
        assert_relative_eq!(y, 24.0);
    }

    #[test]
    fn test_barrel_distortion_samples_further_out() {
        let intrinsics = calibration(vec![0.2]).intrinsics().unwrap();
        let (x, y) = intrinsics.distort(532.0, 24.0);
        // r = 1 in normalized coordinates: radial factor 1.2
        assert_relative_eq!(x, 632.0, epsilon = 1e-9);
        assert_relative_eq!(y, 24.0);
    }

    #[test]
    fn test_invalid_calibration_is_rejected() {
        let mut bad = calibration(vec![]);
        bad.camera_matrix[0][0] = 0.0;
        assert!(matches!(bad.intrinsics(), Err(PipelineError::Calibration(_))));

        let too_many = calibration(vec![0.0; 8]);
        assert!(matches!(too_many.intrinsics(), Err(PipelineError::Calibration(_))));
    }

    #[test]
    fn test_load_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("camera.json");
        fs::write(
            &path,
            r#"{"camera_matrix": [[800, 0, 320], [0, 810, 240], [0, 0, 1]], "distortion_coefficients": [-0.2, 0.05, 0, 0, 0]}"#,
        )
        .unwrap();

        let loaded = CameraCalibration::load(&path).unwrap();
        assert_eq!(loaded.camera_matrix[1][1], 810.0);
        assert_eq!(loaded.distortion_coefficients.len(), 5);
        assert_eq!(loaded.reprojection_error, None);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("camera.json");
        let mut camera = calibration(vec![-0.1, 0.01, 0.0, 0.0, 0.0]);
        camera.reprojection_error = Some(0.21);

        camera.save(&path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"camera_matrix\""));
        assert!(text.contains("\"distortion_coefficients\""));
        assert_eq!(CameraCalibration::load(&path).unwrap(), camera);
    }
}

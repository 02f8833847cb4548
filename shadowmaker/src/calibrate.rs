// Camera calibration from chessboard photos
// Zhang's closed-form intrinsics from plane homographies, refined with Levenberg-Marquardt

use std::path::{Path, PathBuf};

use image::GrayImage;
use nalgebra::{DMatrix, DVector, Matrix3, Point2, Rotation3, Vector3};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::calibration::{CameraCalibration, Intrinsics};
use crate::chessboard::{find_chessboard, BoardSize};
use crate::debug::save_corner_image;
use crate::error::{PipelineError, Result};
use crate::lm::{levenberg_marquardt, LmProblem, LmSettings};

/// Zhang's method needs three tilted views for a unique solution
pub const MIN_VIEWS: usize = 3;

const INTRINSIC_PARAMS: usize = 9;
const POSE_PARAMS: usize = 6;

/// A printed chessboard: inner corner layout and square size
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Board {
    pub size: BoardSize,
    /// Edge of one square; the unit only scales the poses
    pub square: f64,
}

impl Board {
    /// Corner positions on the board plane, in the order `find_chessboard` returns them
    pub fn object_points(&self) -> Vec<Point2<f64>> {
        (0..self.size.rows)
            .flat_map(|j| (0..self.size.cols).map(move |i| (i, j)))
            .map(|(i, j)| Point2::new(i as f64 * self.square, j as f64 * self.square))
            .collect()
    }
}

/// Board pose relative to the camera
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub rotation: Rotation3<f64>,
    pub translation: Vector3<f64>,
}

#[derive(Debug, Clone)]
pub struct CalibrationReport {
    pub calibration: CameraCalibration,
    /// RMS reprojection error over all corners, in pixels
    pub rms_error: f64,
    /// RMS reprojection error of each view
    pub view_errors: Vec<f64>,
    pub poses: Vec<Pose>,
}

/// Outcome of looking for the board in one photo
#[derive(Debug, Clone)]
pub struct BoardView {
    pub path: PathBuf,
    pub corners: Option<Vec<Point2<f64>>>,
}

fn normalizing_transform(points: &[Point2<f64>]) -> Matrix3<f64> {
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.x).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.y).sum::<f64>() / n;
    let mean_dist = points
        .iter()
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    let s = if mean_dist > 1e-12 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0)
}

fn transform(h: &Matrix3<f64>, p: &Point2<f64>) -> Point2<f64> {
    let v = h * Vector3::new(p.x, p.y, 1.0);
    Point2::new(v.x / v.z, v.y / v.z)
}

/// Right singular vector of the smallest singular value
fn null_vector(a: DMatrix<f64>) -> Option<DVector<f64>> {
    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let (index, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    Some(v_t.row(index).transpose())
}

/// Normalized DLT: `H` with `dst ~ H * src`, scaled so `H[2][2] = 1`.
pub fn homography(src: &[Point2<f64>], dst: &[Point2<f64>]) -> Option<Matrix3<f64>> {
    if src.len() != dst.len() || src.len() < 4 {
        return None;
    }
    let t_src = normalizing_transform(src);
    let t_dst = normalizing_transform(dst);

    let rows = (2 * src.len()).max(9);
    let mut a = DMatrix::<f64>::zeros(rows, 9);
    for (k, (s, d)) in src.iter().zip(dst).enumerate() {
        let s = transform(&t_src, s);
        let d = transform(&t_dst, d);
        let (x, y, u, v) = (s.x, s.y, d.x, d.y);

        let r = 2 * k;
        a[(r, 0)] = -x;
        a[(r, 1)] = -y;
        a[(r, 2)] = -1.0;
        a[(r, 6)] = u * x;
        a[(r, 7)] = u * y;
        a[(r, 8)] = u;

        a[(r + 1, 3)] = -x;
        a[(r + 1, 4)] = -y;
        a[(r + 1, 5)] = -1.0;
        a[(r + 1, 6)] = v * x;
        a[(r + 1, 7)] = v * y;
        a[(r + 1, 8)] = v;
    }

    let h = null_vector(a)?;
    let normalized = Matrix3::from_row_slice(h.as_slice());
    let h = t_dst.try_inverse()? * normalized * t_src;
    let scale = h[(2, 2)];
    if scale.abs() < 1e-12 || !scale.is_finite() {
        return None;
    }
    Some(h / scale)
}

/// Constraint row `h_iᵀ B h_j` on `b = [B11, B12, B22, B13, B23, B33]`
fn v_row(h: &Matrix3<f64>, i: usize, j: usize) -> [f64; 6] {
    let a = |k: usize| h[(k, i)];
    let b = |k: usize| h[(k, j)];
    [
        a(0) * b(0),
        a(0) * b(1) + a(1) * b(0),
        a(1) * b(1),
        a(2) * b(0) + a(0) * b(2),
        a(2) * b(1) + a(1) * b(2),
        a(2) * b(2),
    ]
}

/// Pixel to roughly unit coordinates, so the constraint rows are well conditioned
fn image_normalization(width: u32, height: u32) -> (Matrix3<f64>, f64) {
    let s = 2.0 / width.max(height).max(1) as f64;
    let t = Matrix3::new(
        s,
        0.0,
        -s * width as f64 / 2.0,
        0.0,
        s,
        -s * height as f64 / 2.0,
        0.0,
        0.0,
        1.0,
    );
    (t, s)
}

/// Closed-form camera matrix from board homographies, assuming zero skew.
fn initial_camera_matrix(homographies: &[Matrix3<f64>], width: u32, height: u32) -> Result<Matrix3<f64>> {
    let (t, s) = image_normalization(width, height);

    let mut v = DMatrix::<f64>::zeros(2 * homographies.len() + 1, 6);
    for (k, h) in homographies.iter().enumerate() {
        let h = t * h;
        let v12 = v_row(&h, 0, 1);
        let v11 = v_row(&h, 0, 0);
        let v22 = v_row(&h, 1, 1);
        for c in 0..6 {
            v[(2 * k, c)] = v12[c];
            v[(2 * k + 1, c)] = v11[c] - v22[c];
        }
    }
    // B12 = 0 <=> no skew
    v[(2 * homographies.len(), 1)] = 1.0;

    let b = null_vector(v).ok_or_else(|| PipelineError::Calibration("could not solve for intrinsics".into()))?;
    let b = if b[0] < 0.0 { -b } else { b };
    let (b11, b12, b22, b13, b23, b33) = (b[0], b[1], b[2], b[3], b[4], b[5]);

    let denom = b11 * b22 - b12 * b12;
    let v0 = (b12 * b13 - b11 * b23) / denom;
    let lambda = b33 - (b13 * b13 + v0 * (b12 * b13 - b11 * b23)) / b11;
    let alpha = (lambda / b11).sqrt();
    let beta = (lambda * b11 / denom).sqrt();
    let u0 = -b13 * alpha * alpha / lambda;

    if ![alpha, beta, u0, v0].iter().all(|x| x.is_finite()) || alpha <= 0.0 || beta <= 0.0 {
        return Err(PipelineError::Calibration(
            "board views do not determine the focal length; tilt the board differently between photos".into(),
        ));
    }

    Ok(Matrix3::new(
        alpha / s,
        0.0,
        u0 / s + width as f64 / 2.0,
        0.0,
        beta / s,
        v0 / s + height as f64 / 2.0,
        0.0,
        0.0,
        1.0,
    ))
}

/// Board pose from its homography and the camera matrix
fn initial_pose(k: &Matrix3<f64>, h: &Matrix3<f64>) -> Option<Pose> {
    let m = k.try_inverse()? * h;
    let (c1, c2, c3) = (m.column(0).into_owned(), m.column(1).into_owned(), m.column(2).into_owned());
    let norm = c1.norm();
    if norm < 1e-12 {
        return None;
    }

    let mut scale = 1.0 / norm;
    // Board in front of the camera
    if c3.z * scale < 0.0 {
        scale = -scale;
    }
    let r1 = c1 * scale;
    let r2 = c2 * scale;
    let r3 = r1.cross(&r2);
    let rotation = Rotation3::from_matrix(&Matrix3::from_columns(&[r1, r2, r3]));

    Some(Pose {
        rotation,
        translation: c3 * scale,
    })
}

fn project(intrinsics: &Intrinsics, pose: &Pose, object: &Point2<f64>) -> Point2<f64> {
    let p = pose.rotation * Vector3::new(object.x, object.y, 0.0) + pose.translation;
    let (xd, yd) = intrinsics.distort_normalized(p.x / p.z, p.y / p.z);
    Point2::new(intrinsics.fx * xd + intrinsics.cx, intrinsics.fy * yd + intrinsics.cy)
}

/// Joint refinement of intrinsics, distortion and every board pose
struct Reprojection<'a> {
    object: &'a [Point2<f64>],
    views: &'a [Vec<Point2<f64>>],
}

fn unpack_intrinsics(p: &DVector<f64>) -> Intrinsics {
    Intrinsics {
        fx: p[0],
        fy: p[1],
        cx: p[2],
        cy: p[3],
        k1: p[4],
        k2: p[5],
        p1: p[6],
        p2: p[7],
        k3: p[8],
    }
}

fn unpack_pose(p: &DVector<f64>, view: usize) -> Pose {
    let o = INTRINSIC_PARAMS + view * POSE_PARAMS;
    Pose {
        rotation: Rotation3::new(Vector3::new(p[o], p[o + 1], p[o + 2])),
        translation: Vector3::new(p[o + 3], p[o + 4], p[o + 5]),
    }
}

fn pack(intrinsics: &Intrinsics, poses: &[Pose]) -> DVector<f64> {
    let mut p = vec![
        intrinsics.fx,
        intrinsics.fy,
        intrinsics.cx,
        intrinsics.cy,
        intrinsics.k1,
        intrinsics.k2,
        intrinsics.p1,
        intrinsics.p2,
        intrinsics.k3,
    ];
    for pose in poses {
        let r = pose.rotation.scaled_axis();
        p.extend([r.x, r.y, r.z, pose.translation.x, pose.translation.y, pose.translation.z]);
    }
    DVector::from_vec(p)
}

impl LmProblem for Reprojection<'_> {
    fn residual(&self, p: &DVector<f64>) -> DVector<f64> {
        let intrinsics = unpack_intrinsics(p);
        let mut r = Vec::with_capacity(2 * self.object.len() * self.views.len());
        for (v, observed) in self.views.iter().enumerate() {
            let pose = unpack_pose(p, v);
            for (object, seen) in self.object.iter().zip(observed) {
                let predicted = project(&intrinsics, &pose, object);
                r.push(predicted.x - seen.x);
                r.push(predicted.y - seen.y);
            }
        }
        DVector::from_vec(r)
    }
}

fn rms(residuals: &[f64]) -> f64 {
    let points = residuals.len() / 2;
    if points == 0 {
        return 0.0;
    }
    (residuals.iter().map(|r| r * r).sum::<f64>() / points as f64).sqrt()
}

/// Solve for the camera from corner observations of `board` in photos of `width`x`height`.
pub fn calibrate(board: &Board, views: &[Vec<Point2<f64>>], width: u32, height: u32) -> Result<CalibrationReport> {
    if views.len() < MIN_VIEWS {
        return Err(PipelineError::TooFewViews {
            found: views.len(),
            needed: MIN_VIEWS,
        });
    }
    let object = board.object_points();
    if let Some(bad) = views.iter().find(|v| v.len() != object.len()) {
        return Err(PipelineError::Calibration(format!(
            "expected {} corners per view, got {}",
            object.len(),
            bad.len()
        )));
    }

    let homographies = views
        .iter()
        .map(|corners| homography(&object, corners))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| PipelineError::Calibration("degenerate board view".into()))?;

    let k = initial_camera_matrix(&homographies, width, height)?;
    let poses = homographies
        .iter()
        .map(|h| initial_pose(&k, h))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| PipelineError::Calibration("could not recover a board pose".into()))?;
    let initial = Intrinsics {
        fx: k[(0, 0)],
        fy: k[(1, 1)],
        cx: k[(0, 2)],
        cy: k[(1, 2)],
        k1: 0.0,
        k2: 0.0,
        p1: 0.0,
        p2: 0.0,
        k3: 0.0,
    };
    debug!(fx = initial.fx, fy = initial.fy, cx = initial.cx, cy = initial.cy, "closed-form estimate");

    let problem = Reprojection {
        object: &object,
        views,
    };
    let outcome = levenberg_marquardt(&problem, pack(&initial, &poses), &LmSettings::default());
    debug!(iterations = outcome.iterations, cost = outcome.cost, "refinement done");

    let intrinsics = unpack_intrinsics(&outcome.params);
    if !(intrinsics.fx > 0.0 && intrinsics.fy > 0.0) {
        return Err(PipelineError::Calibration("refinement diverged".into()));
    }

    let residuals = problem.residual(&outcome.params);
    let per_view = 2 * object.len();
    let view_errors: Vec<f64> = residuals.as_slice().chunks(per_view).map(rms).collect();
    let rms_error = rms(residuals.as_slice());
    let poses = (0..views.len()).map(|v| unpack_pose(&outcome.params, v)).collect();

    info!(
        fx = intrinsics.fx,
        fy = intrinsics.fy,
        cx = intrinsics.cx,
        cy = intrinsics.cy,
        rms_error,
        "calibrated from {} view(s)",
        views.len()
    );

    Ok(CalibrationReport {
        calibration: intrinsics.to_calibration(Some(rms_error)),
        rms_error,
        view_errors,
        poses,
    })
}

fn load_gray(path: &Path) -> Result<GrayImage> {
    image::open(path)
        .map(|img| img.to_luma8())
        .map_err(|source| PipelineError::ImageLoad {
            path: path.to_path_buf(),
            source,
        })
}

/// Look for the board in every photo. All photos must share one size, which is returned.
/// With `debug_dir`, an image with the found corners is saved per photo.
pub fn detect_boards(paths: &[PathBuf], size: BoardSize, debug_dir: Option<&Path>) -> Result<(Vec<BoardView>, (u32, u32))> {
    let detected = paths
        .par_iter()
        .map(|path| -> Result<(BoardView, (u32, u32))> {
            let gray = load_gray(path)?;
            let corners = find_chessboard(&gray, size);
            match &corners {
                Some(_) => info!("chessboard found in {}", path.display()),
                None => warn!("no {} chessboard in {}", size, path.display()),
            }
            if let (Some(dir), Some(found)) = (debug_dir, &corners) {
                if let Err(e) = save_corner_image(dir, path, &gray, found, size) {
                    warn!("corner image not saved: {}", e);
                }
            }
            let view = BoardView {
                path: path.clone(),
                corners,
            };
            Ok((view, gray.dimensions()))
        })
        .collect::<Result<Vec<_>>>()?;

    let expected = detected.first().map(|(_, dims)| *dims).unwrap_or((0, 0));
    if let Some((view, (width, height))) = detected.iter().find(|(_, dims)| *dims != expected) {
        return Err(PipelineError::ImageSizeMismatch {
            path: view.path.clone(),
            width: *width,
            height: *height,
            expected_width: expected.0,
            expected_height: expected.1,
        });
    }

    Ok((detected.into_iter().map(|(view, _)| view).collect(), expected))
}

/// Detect the board in `paths` and solve for the camera.
pub fn calibrate_images(paths: &[PathBuf], board: &Board, debug_dir: Option<&Path>) -> Result<(Vec<BoardView>, CalibrationReport)> {
    let (views, (width, height)) = detect_boards(paths, board.size, debug_dir)?;
    let corners: Vec<Vec<Point2<f64>>> = views.iter().filter_map(|v| v.corners.clone()).collect();
    if corners.len() < MIN_VIEWS {
        return Err(PipelineError::TooFewViews {
            found: corners.len(),
            needed: MIN_VIEWS,
        });
    }

    let report = calibrate(board, &corners, width, height)?;
    Ok((views, report))
}

// Chessboard corner detection
// Finds the inner corners of a printed calibration board and orders them row by row

use std::fmt;
use std::str::FromStr;

use image::GrayImage;
use imageproc::filter::gaussian_blur_f32;
use nalgebra::{Matrix2, Matrix3, Point2, Vector2, Vector3};
use rayon::prelude::*;
use tracing::debug;

use crate::calibrate::homography;

/// Sample ring of the saddle response, radius 5, in angular order
const RING: [(i32, i32); 16] = [
    (5, 0),
    (5, 2),
    (4, 4),
    (2, 5),
    (0, 5),
    (-2, 5),
    (-4, 4),
    (-5, 2),
    (-5, 0),
    (-5, -2),
    (-4, -4),
    (-2, -5),
    (0, -5),
    (2, -5),
    (4, -4),
    (5, -2),
];
const RING_RADIUS: i32 = 5;
const BLUR_SIGMA: f32 = 1.0;
/// Candidates weaker than this fraction of the strongest are dropped
const RESPONSE_FRACTION: f32 = 0.2;
/// Neighborhood for non-maximum suppression, in pixels
const NMS_RADIUS: i32 = 4;
/// Largest sub-pixel window half-size, as cornerSubPix with an 11 px half window
const MAX_REFINE_HALF_WINDOW: i32 = 11;
const REFINE_ITERATIONS: usize = 30;
const REFINE_EPS: f64 = 0.01;
/// Matched corners must lie within this fraction of a square of their grid prediction
const MATCH_TOLERANCE: f64 = 0.5;

/// Inner corner count of a board, e.g. `9x6`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardSize {
    pub cols: u32,
    pub rows: u32,
}

impl BoardSize {
    pub fn corners(&self) -> usize {
        (self.cols * self.rows) as usize
    }
}

impl Default for BoardSize {
    fn default() -> Self {
        Self { cols: 9, rows: 6 }
    }
}

impl fmt::Display for BoardSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

impl FromStr for BoardSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (cols, rows) = s
            .to_ascii_lowercase()
            .split_once('x')
            .map(|(c, r)| (c.trim().parse::<u32>(), r.trim().parse::<u32>()))
            .ok_or_else(|| format!("board size '{}' is not COLSxROWS", s))?;
        match (cols, rows) {
            (Ok(cols), Ok(rows)) if cols >= 2 && rows >= 2 => Ok(Self { cols, rows }),
            _ => Err(format!("board size '{}' needs at least 2x2 inner corners", s)),
        }
    }
}

/// Single-channel f32 copy of an image with clamped reads
struct Plane {
    width: i32,
    height: i32,
    data: Vec<f32>,
}

impl Plane {
    fn from_gray(image: &GrayImage) -> Self {
        Self {
            width: image.width() as i32,
            height: image.height() as i32,
            data: image.as_raw().iter().map(|&v| v as f32).collect(),
        }
    }

    fn at(&self, x: i32, y: i32) -> f32 {
        let x = x.clamp(0, self.width - 1);
        let y = y.clamp(0, self.height - 1);
        self.data[(y * self.width + x) as usize]
    }
}

/// ChESS saddle response: high on X-junctions, negative on edges and L-corners.
fn saddle_response(plane: &Plane) -> Vec<f32> {
    let (w, h) = (plane.width, plane.height);
    let margin = RING_RADIUS + 1;
    let mut response = vec![0.0f32; (w * h) as usize];

    response.par_chunks_mut(w as usize).enumerate().for_each(|(y, row)| {
        let y = y as i32;
        if y < margin || y >= h - margin {
            return;
        }
        for x in margin..w - margin {
            let ring: [f32; 16] = RING.map(|(dx, dy)| plane.at(x + dx, y + dy));

            let sum_response: f32 = (0..4)
                .map(|n| ((ring[n] + ring[n + 8]) - (ring[n + 4] + ring[n + 12])).abs())
                .sum();
            let diff_response: f32 = (0..8).map(|n| (ring[n] - ring[n + 8]).abs()).sum();
            let ring_mean = ring.iter().sum::<f32>() / 16.0;
            let local_mean = (plane.at(x, y)
                + plane.at(x - 1, y)
                + plane.at(x + 1, y)
                + plane.at(x, y - 1)
                + plane.at(x, y + 1))
                / 5.0;

            row[x as usize] = sum_response - diff_response - 16.0 * (ring_mean - local_mean).abs();
        }
    });

    response
}

/// Local maxima of the response, strongest first, at least `NMS_RADIUS` apart
fn candidates(response: &[f32], width: i32, height: i32) -> Vec<(Point2<f64>, f32)> {
    let max = response.iter().copied().fold(0.0f32, f32::max);
    if max <= 0.0 {
        return Vec::new();
    }
    let floor = max * RESPONSE_FRACTION;

    let mut peaks = Vec::new();
    for y in 0..height {
        for x in 0..width {
            let value = response[(y * width + x) as usize];
            if value < floor {
                continue;
            }
            let is_peak = (-NMS_RADIUS..=NMS_RADIUS).all(|dy| {
                (-NMS_RADIUS..=NMS_RADIUS).all(|dx| {
                    let (nx, ny) = (x + dx, y + dy);
                    nx < 0 || ny < 0 || nx >= width || ny >= height || response[(ny * width + nx) as usize] <= value
                })
            });
            if is_peak {
                peaks.push((Point2::new(x as f64, y as f64), value));
            }
        }
    }

    peaks.sort_by(|a, b| b.1.total_cmp(&a.1));
    let mut kept: Vec<(Point2<f64>, f32)> = Vec::with_capacity(peaks.len());
    for peak in peaks {
        let clear = kept
            .iter()
            .all(|k| (k.0 - peak.0).norm() > NMS_RADIUS as f64);
        if clear {
            kept.push(peak);
        }
    }
    kept
}

fn cross(o: &Point2<f64>, a: &Point2<f64>, b: &Point2<f64>) -> f64 {
    (a.x - o.x) * (b.y - o.y) - (a.y - o.y) * (b.x - o.x)
}

/// Monotone chain hull, collinear points dropped
fn convex_hull(points: &[Point2<f64>]) -> Vec<Point2<f64>> {
    let mut sorted = points.to_vec();
    sorted.sort_by(|a, b| a.x.total_cmp(&b.x).then(a.y.total_cmp(&b.y)));
    if sorted.len() < 3 {
        return sorted;
    }

    let mut hull: Vec<Point2<f64>> = Vec::with_capacity(sorted.len() * 2);
    for p in &sorted {
        while hull.len() >= 2 && cross(&hull[hull.len() - 2], &hull[hull.len() - 1], p) <= 0.0 {
            hull.pop();
        }
        hull.push(*p);
    }
    let lower = hull.len() + 1;
    for p in sorted.iter().rev().skip(1) {
        while hull.len() >= lower && cross(&hull[hull.len() - 2], &hull[hull.len() - 1], p) <= 0.0 {
            hull.pop();
        }
        hull.push(*p);
    }
    hull.pop();
    hull
}

/// Drop the flattest vertex until four remain
fn simplify_to_quad(mut polygon: Vec<Point2<f64>>) -> Option<[Point2<f64>; 4]> {
    while polygon.len() > 4 {
        let n = polygon.len();
        let flattest = (0..n)
            .map(|i| {
                let (a, b, c) = (polygon[i], polygon[(i + 1) % n], polygon[(i + 2) % n]);
                (cross(&a, &b, &c).abs(), (i + 1) % n)
            })
            .min_by(|a, b| a.0.total_cmp(&b.0))?
            .1;
        polygon.remove(flattest);
    }
    polygon.try_into().ok()
}

fn apply(h: &Matrix3<f64>, p: &Point2<f64>) -> Point2<f64> {
    let v = h * Vector3::new(p.x, p.y, 1.0);
    Point2::new(v.x / v.z, v.y / v.z)
}

/// Assign `points` to the `size` grid, row by row, using the board's outer corners.
fn order_grid(points: &[Point2<f64>], size: BoardSize) -> Option<Vec<Point2<f64>>> {
    let mut quad = simplify_to_quad(convex_hull(points))?;
    let len = |a: usize, b: usize| (quad[a] - quad[b]).norm();

    // Edge 0-1 runs along the rows
    let first_pair_longer = len(0, 1) + len(2, 3) >= len(1, 2) + len(3, 0);
    if first_pair_longer != (size.cols >= size.rows) {
        quad.rotate_left(1);
    }

    let (last_col, last_row) = ((size.cols - 1) as f64, (size.rows - 1) as f64);
    let grid_quad = [
        Point2::new(0.0, 0.0),
        Point2::new(last_col, 0.0),
        Point2::new(last_col, last_row),
        Point2::new(0.0, last_row),
    ];
    let h = homography(&grid_quad, &quad)?;

    let spacing = [
        (quad[1] - quad[0]).norm() / last_col,
        (quad[2] - quad[1]).norm() / last_row,
        (quad[3] - quad[2]).norm() / last_col,
        (quad[0] - quad[3]).norm() / last_row,
    ]
    .into_iter()
    .fold(f64::MAX, f64::min);
    let tolerance = spacing * MATCH_TOLERANCE;

    let mut used = vec![false; points.len()];
    let mut ordered = Vec::with_capacity(size.corners());
    for row in 0..size.rows {
        for col in 0..size.cols {
            let predicted = apply(&h, &Point2::new(col as f64, row as f64));
            let (best, distance) = points
                .iter()
                .enumerate()
                .filter(|(i, _)| !used[*i])
                .map(|(i, p)| (i, (p - predicted).norm()))
                .min_by(|a, b| a.1.total_cmp(&b.1))?;
            if distance > tolerance {
                debug!(row, col, distance, tolerance, "no corner near grid position");
                return None;
            }
            used[best] = true;
            ordered.push(points[best]);
        }
    }
    Some(ordered)
}

/// Move a corner to where the image gradients around it all point away from it
/// (the cornerSubPix criterion).
fn refine_corner(plane: &Plane, corner: Point2<f64>, half_window: i32) -> Point2<f64> {
    let mut estimate = corner;
    let sigma2 = (half_window as f64 * half_window as f64).max(1.0);

    for _ in 0..REFINE_ITERATIONS {
        let (cx, cy) = (estimate.x.round() as i32, estimate.y.round() as i32);
        if cx - half_window < 1
            || cy - half_window < 1
            || cx + half_window >= plane.width - 1
            || cy + half_window >= plane.height - 1
        {
            return estimate;
        }

        let mut a = Matrix2::zeros();
        let mut b = Vector2::zeros();
        for dy in -half_window..=half_window {
            for dx in -half_window..=half_window {
                let (x, y) = (cx + dx, cy + dy);
                let gx = 0.5 * (plane.at(x + 1, y) - plane.at(x - 1, y)) as f64;
                let gy = 0.5 * (plane.at(x, y + 1) - plane.at(x, y - 1)) as f64;
                let weight = (-((dx * dx + dy * dy) as f64) / (2.0 * sigma2)).exp();
                let g = Matrix2::new(gx * gx, gx * gy, gx * gy, gy * gy) * weight;
                a += g;
                b += g * Vector2::new(x as f64, y as f64);
            }
        }

        let Some(next) = a.try_inverse().map(|inv| inv * b) else {
            return estimate;
        };
        let next = Point2::new(next.x, next.y);
        let moved = (next - estimate).norm();
        estimate = next;
        if moved < REFINE_EPS {
            break;
        }
    }

    if (estimate - corner).norm() > half_window as f64 {
        corner
    } else {
        estimate
    }
}

/// Inner corners of a `size` chessboard, row-major, with sub-pixel accuracy.
/// `None` when the board is not found in full.
pub fn find_chessboard(gray: &GrayImage, size: BoardSize) -> Option<Vec<Point2<f64>>> {
    let (width, height) = (gray.width() as i32, gray.height() as i32);
    let margin = 2 * (RING_RADIUS + 1);
    if width <= margin || height <= margin {
        return None;
    }

    let plane = Plane::from_gray(&gaussian_blur_f32(gray, BLUR_SIGMA));
    let response = saddle_response(&plane);
    let mut found = candidates(&response, width, height);
    debug!(candidates = found.len(), needed = size.corners(), "saddle points");
    if found.len() < size.corners() {
        return None;
    }
    found.truncate(size.corners());

    let points: Vec<Point2<f64>> = found.into_iter().map(|(p, _)| p).collect();
    let ordered = order_grid(&points, size)?;

    let spacing = ordered
        .windows(2)
        .enumerate()
        .filter(|(i, _)| (i + 1) % size.cols as usize != 0)
        .map(|(_, pair)| (pair[1] - pair[0]).norm())
        .fold(f64::MAX, f64::min);
    let half_window = ((spacing * 0.4) as i32).clamp(2, MAX_REFINE_HALF_WINDOW);

    Some(
        ordered
            .into_iter()
            .map(|p| refine_corner(&plane, p, half_window))
            .collect(),
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::Luma;

    /// Render a board with `size` inner corners. `to_board` maps a pixel to board
    /// coordinates in squares, with the outer corner of the board at the origin.
    pub(crate) fn render_board(
        width: u32,
        height: u32,
        size: BoardSize,
        to_board: impl Fn(f64, f64) -> Option<(f64, f64)>,
    ) -> GrayImage {
        const SUB: u32 = 4;
        let (squares_x, squares_y) = ((size.cols + 1) as f64, (size.rows + 1) as f64);
        GrayImage::from_fn(width, height, |x, y| {
            let mut sum = 0u32;
            for sy in 0..SUB {
                for sx in 0..SUB {
                    let u = x as f64 + (sx as f64 + 0.5) / SUB as f64 - 0.5;
                    let v = y as f64 + (sy as f64 + 0.5) / SUB as f64 - 0.5;
                    let dark = match to_board(u, v) {
                        Some((bx, by)) if bx >= 0.0 && by >= 0.0 && bx < squares_x && by < squares_y => {
                            (bx.floor() as i64 + by.floor() as i64) % 2 == 0
                        }
                        _ => false,
                    };
                    sum += if dark { 30 } else { 225 };
                }
            }
            Luma([(sum / (SUB * SUB)) as u8])
        })
    }

    fn flat_board(size: BoardSize, square: f64, origin: (f64, f64)) -> GrayImage {
        render_board(400, 300, size, |u, v| Some(((u - origin.0) / square, (v - origin.1) / square)))
    }

    #[test]
    fn test_board_size_parsing() {
        assert_eq!("9x6".parse::<BoardSize>(), Ok(BoardSize { cols: 9, rows: 6 }));
        assert_eq!(" 7X5 ".trim().parse::<BoardSize>(), Ok(BoardSize { cols: 7, rows: 5 }));
        assert!("9".parse::<BoardSize>().is_err());
        assert!("1x6".parse::<BoardSize>().is_err());
        assert!("ax6".parse::<BoardSize>().is_err());
        assert_eq!(BoardSize::default().to_string(), "9x6");
    }

    #[test]
    fn test_saddle_response_prefers_x_junctions() {
        let size = BoardSize { cols: 3, rows: 2 };
        let img = flat_board(size, 30.0, (50.5, 40.5));
        let plane = Plane::from_gray(&gaussian_blur_f32(&img, BLUR_SIGMA));
        let response = saddle_response(&plane);
        let at = |x: i32, y: i32| response[(y * plane.width + x) as usize];

        // Inner corner, outer board corner, edge between two squares
        assert!(at(80, 70) > 0.0);
        assert!(at(50, 40) < 0.0);
        assert!(at(80, 55) < 0.0);
    }

    #[test]
    fn test_finds_flat_board_in_order() {
        let size = BoardSize { cols: 9, rows: 6 };
        let (square, origin) = (24.0, (60.3, 50.7));
        let img = flat_board(size, square, origin);

        let corners = find_chessboard(&img, size).expect("board found");
        assert_eq!(corners.len(), 54);

        for (k, corner) in corners.iter().enumerate() {
            let truth_distance = (0..size.rows)
                .flat_map(|j| (0..size.cols).map(move |i| (i, j)))
                .map(|(i, j)| {
                    let truth = Point2::new(origin.0 + (i + 1) as f64 * square, origin.1 + (j + 1) as f64 * square);
                    (corner - truth).norm()
                })
                .fold(f64::MAX, f64::min);
            assert!(truth_distance < 0.2, "corner {} is {:.3} px off", k, truth_distance);
        }

        // Neighbors within a row are one square apart, rows are one square apart.
        assert!(((corners[1] - corners[0]).norm() - square).abs() < 0.5);
        assert!(((corners[9] - corners[0]).norm() - square).abs() < 0.5);
        assert!(((corners[8] - corners[0]).norm() - 8.0 * square).abs() < 1.0);
    }

    #[test]
    fn test_tilted_board_is_found() {
        let size = BoardSize { cols: 7, rows: 5 };
        let (angle, square) = (0.3f64, 26.0);
        let (s, c) = angle.sin_cos();
        let img = render_board(400, 320, size, |u, v| {
            let (x, y) = (u - 190.0, v - 160.0);
            Some(((c * x + s * y) / square + 4.0, (-s * x + c * y) / square + 3.0))
        });

        let corners = find_chessboard(&img, size).expect("board found");
        assert_eq!(corners.len(), 35);
        assert!(((corners[1] - corners[0]).norm() - square).abs() < 0.5);
        assert!(((corners[7] - corners[0]).norm() - square).abs() < 0.5);
    }

    #[test]
    fn test_missing_board() {
        let blank = GrayImage::from_pixel(200, 150, Luma([220]));
        assert!(find_chessboard(&blank, BoardSize::default()).is_none());

        // A 5x4 board does not contain a 9x6 pattern.
        let small = flat_board(BoardSize { cols: 5, rows: 4 }, 25.0, (40.0, 40.0));
        assert!(find_chessboard(&small, BoardSize::default()).is_none());
    }

    #[test]
    fn test_hull_and_quad() {
        let points: Vec<Point2<f64>> = (0..4)
            .flat_map(|j| (0..5).map(move |i| Point2::new(i as f64 * 10.0, j as f64 * 10.0)))
            .collect();
        let hull = convex_hull(&points);
        assert_eq!(hull.len(), 4);

        let quad = simplify_to_quad(vec![
            Point2::new(0.0, 0.0),
            Point2::new(20.0, 0.3),
            Point2::new(40.0, 0.0),
            Point2::new(40.0, 30.0),
            Point2::new(0.0, 30.0),
        ])
        .unwrap();
        assert!(!quad.contains(&Point2::new(20.0, 0.3)));
    }
}

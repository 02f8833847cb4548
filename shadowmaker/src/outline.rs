// Pixel-space outlines and the plane geometry the detectors need

use imageproc::geometry::arc_length;
use imageproc::point::Point;

/// Closed polygon in pixel coordinates (x = column, y = row).
/// The closing edge from the last point back to the first is implicit.
#[derive(Debug, Clone, PartialEq)]
pub struct Outline {
    pub points: Vec<Point<i32>>,
}

impl Outline {
    pub fn new(points: Vec<Point<i32>>) -> Self {
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Enclosed area via the shoelace formula, always non-negative
    pub fn area(&self) -> f64 {
        let n = self.points.len();
        if n < 3 {
            return 0.0;
        }
        let twice: f64 = (0..n)
            .map(|i| {
                let a = self.points[i];
                let b = self.points[(i + 1) % n];
                a.x as f64 * b.y as f64 - b.x as f64 * a.y as f64
            })
            .sum();
        (twice / 2.0).abs()
    }

    /// Length of the closed polyline
    pub fn perimeter(&self) -> f64 {
        if self.points.len() < 2 {
            return 0.0;
        }
        arc_length(&self.points, true)
    }

    pub fn bounds(&self) -> Option<Bounds> {
        Bounds::of_points(self.points.iter().copied())
    }

    pub fn enclosing_circle(&self) -> Option<Circle> {
        min_enclosing_circle(&self.points)
    }
}

/// Axis-aligned pixel bounding box, inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    pub min_x: i32,
    pub min_y: i32,
    pub max_x: i32,
    pub max_y: i32,
}

impl Bounds {
    pub fn of_points(points: impl IntoIterator<Item = Point<i32>>) -> Option<Self> {
        points.into_iter().fold(None, |acc, p| {
            Some(match acc {
                None => Bounds {
                    min_x: p.x,
                    min_y: p.y,
                    max_x: p.x,
                    max_y: p.y,
                },
                Some(b) => Bounds {
                    min_x: b.min_x.min(p.x),
                    min_y: b.min_y.min(p.y),
                    max_x: b.max_x.max(p.x),
                    max_y: b.max_y.max(p.y),
                },
            })
        })
    }

    /// Bounding box of several outlines together
    pub fn of_outlines<'a>(outlines: impl IntoIterator<Item = &'a Outline>) -> Option<Self> {
        Self::of_points(outlines.into_iter().flat_map(|o| o.points.iter().copied()))
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_x as f64 + self.max_x as f64) / 2.0,
            (self.min_y as f64 + self.max_y as f64) / 2.0,
        )
    }

    pub fn width(&self) -> f64 {
        (self.max_x - self.min_x) as f64
    }

    pub fn height(&self) -> f64 {
        (self.max_y - self.min_y) as f64
    }
}

/// Circle in pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Circle {
    pub center: (f64, f64),
    pub radius: f64,
}

impl Circle {
    pub fn diameter(&self) -> f64 {
        2.0 * self.radius
    }

    fn contains(&self, p: (f64, f64)) -> bool {
        distance(self.center, p) <= self.radius + 1e-7 * self.radius.max(1.0)
    }

    fn through_two(a: (f64, f64), b: (f64, f64)) -> Self {
        Circle {
            center: ((a.0 + b.0) / 2.0, (a.1 + b.1) / 2.0),
            radius: distance(a, b) / 2.0,
        }
    }

    /// Circumcircle; `None` for collinear points
    fn through_three(a: (f64, f64), b: (f64, f64), c: (f64, f64)) -> Option<Self> {
        let d = 2.0 * (a.0 * (b.1 - c.1) + b.0 * (c.1 - a.1) + c.0 * (a.1 - b.1));
        if d.abs() < 1e-12 {
            return None;
        }
        let a2 = a.0 * a.0 + a.1 * a.1;
        let b2 = b.0 * b.0 + b.1 * b.1;
        let c2 = c.0 * c.0 + c.1 * c.1;
        let ux = (a2 * (b.1 - c.1) + b2 * (c.1 - a.1) + c2 * (a.1 - b.1)) / d;
        let uy = (a2 * (c.0 - b.0) + b2 * (a.0 - c.0) + c2 * (b.0 - a.0)) / d;
        let center = (ux, uy);
        Some(Circle {
            center,
            radius: distance(center, a).max(distance(center, b)).max(distance(center, c)),
        })
    }

    /// Smallest circle with all three points on or inside it, given that
    /// `a` and `b` must lie on its boundary.
    fn bounding_three(a: (f64, f64), b: (f64, f64), c: (f64, f64)) -> Self {
        Circle::through_three(a, b, c).unwrap_or_else(|| {
            // Collinear: the two farthest-apart points span the circle.
            [(a, b), (a, c), (b, c)]
                .into_iter()
                .map(|(p, q)| Circle::through_two(p, q))
                .fold(Circle::through_two(a, b), |best, wide| if wide.radius > best.radius { wide } else { best })
        })
    }
}

fn distance(a: (f64, f64), b: (f64, f64)) -> f64 {
    (a.0 - b.0).hypot(a.1 - b.1)
}

/// Exact minimum enclosing circle (incremental Welzl construction).
pub fn min_enclosing_circle(points: &[Point<i32>]) -> Option<Circle> {
    let pts = scattered(points);
    let first = *pts.first()?;

    let mut circle = Circle {
        center: first,
        radius: 0.0,
    };

    for i in 1..pts.len() {
        if circle.contains(pts[i]) {
            continue;
        }
        circle = Circle {
            center: pts[i],
            radius: 0.0,
        };
        for j in 0..i {
            if circle.contains(pts[j]) {
                continue;
            }
            circle = Circle::through_two(pts[i], pts[j]);
            for k in 0..j {
                if !circle.contains(pts[k]) {
                    circle = Circle::bounding_three(pts[i], pts[j], pts[k]);
                }
            }
        }
    }

    Some(circle)
}

/// Visit points in a scattered order; contour order is the worst case
/// for the incremental construction.
fn scattered(points: &[Point<i32>]) -> Vec<(f64, f64)> {
    let n = points.len();
    if n < 3 {
        return points.iter().map(|p| (p.x as f64, p.y as f64)).collect();
    }

    let mut stride = ((n as f64 * 0.618) as usize).max(1);
    while gcd(stride, n) != 1 {
        stride += 1;
    }

    (0..n)
        .map(|i| {
            let p = points[(i * stride) % n];
            (p.x as f64, p.y as f64)
        })
        .collect()
}

fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

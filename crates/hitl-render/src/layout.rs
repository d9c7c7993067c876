//! 2-D coordinates for depiction.
//!
//! Atoms are placed by stress majorization: every atom pair is pulled
//! towards a distance proportional to the number of bonds between them
//! (Kamada-Kawai targets). Seeding is a golden-angle spiral and the
//! iteration count is fixed, so the layout is a pure function of the graph.

use std::f64::consts::PI;

use crate::molecule::Molecule;

const ITERATIONS: usize = 300;
const MIN_SEPARATION: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(self, other: Point) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// Embed the molecule with unit bond length.
pub fn compute(molecule: &Molecule) -> Vec<Point> {
    let n = molecule.atom_count();
    let mut points = seed(n);
    if n < 2 {
        return points;
    }

    let hops = molecule.topological_distances();
    // Separate fragments by a little more than the longest path.
    let disconnected = hops
        .iter()
        .flatten()
        .filter_map(|d| *d)
        .max()
        .unwrap_or(1) as f64
        + 1.0;
    let target = |i: usize, j: usize| hops[i][j].map_or(disconnected, |d| d as f64);

    for _ in 0..ITERATIONS {
        for i in 0..n {
            let mut sum_w = 0.0;
            let mut x = 0.0;
            let mut y = 0.0;
            for j in 0..n {
                if i == j {
                    continue;
                }
                let d = target(i, j);
                let w = 1.0 / (d * d);
                let (pi, pj) = (points[i], points[j]);
                let actual = pi.distance(pj);
                let (ux, uy) = if actual > MIN_SEPARATION {
                    ((pi.x - pj.x) / actual, (pi.y - pj.y) / actual)
                } else if i > j {
                    (1.0, 0.0)
                } else {
                    (-1.0, 0.0)
                };
                x += w * (pj.x + d * ux);
                y += w * (pj.y + d * uy);
                sum_w += w;
            }
            points[i] = Point::new(x / sum_w, y / sum_w);
        }
    }
    points
}

fn seed(n: usize) -> Vec<Point> {
    let golden = PI * (3.0 - 5f64.sqrt());
    (0..n)
        .map(|i| {
            let r = ((i + 1) as f64).sqrt();
            let theta = i as f64 * golden;
            Point::new(r * theta.cos(), r * theta.sin())
        })
        .collect()
}

/// Map layout coordinates onto a `width` x `height` pixel canvas.
///
/// The drawing is centred, kept `margin` pixels from every edge and never
/// scaled beyond `max_bond_px` pixels per bond. The y axis is flipped.
pub fn fit_to_canvas(
    points: &[Point],
    width: u32,
    height: u32,
    margin: f64,
    max_bond_px: f64,
) -> Vec<(i32, i32)> {
    let cx = f64::from(width) / 2.0;
    let cy = f64::from(height) / 2.0;
    if points.is_empty() {
        return Vec::new();
    }

    let (mut min_x, mut max_x) = (f64::INFINITY, f64::NEG_INFINITY);
    let (mut min_y, mut max_y) = (f64::INFINITY, f64::NEG_INFINITY);
    for p in points {
        min_x = min_x.min(p.x);
        max_x = max_x.max(p.x);
        min_y = min_y.min(p.y);
        max_y = max_y.max(p.y);
    }

    let span_x = max_x - min_x;
    let span_y = max_y - min_y;
    let avail_x = (f64::from(width) - 2.0 * margin).max(1.0);
    let avail_y = (f64::from(height) - 2.0 * margin).max(1.0);

    let mut scale = max_bond_px;
    if span_x > 0.0 {
        scale = scale.min(avail_x / span_x);
    }
    if span_y > 0.0 {
        scale = scale.min(avail_y / span_y);
    }

    let mid_x = (min_x + max_x) / 2.0;
    let mid_y = (min_y + max_y) / 2.0;
    points
        .iter()
        .map(|p| {
            let x = cx + (p.x - mid_x) * scale;
            let y = cy - (p.y - mid_y) * scale;
            (x.round() as i32, y.round() as i32)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smiles;
    use crate::DORAVIRINE_SMILES;

    #[test]
    fn bonded_atoms_sit_near_unit_distance() {
        let mol = smiles::parse("c1ccccc1").unwrap();
        let points = compute(&mol);
        for bond in &mol.bonds {
            let d = points[bond.begin].distance(points[bond.end]);
            assert!((d - 1.0).abs() < 0.35, "bond length {d}");
        }
    }

    #[test]
    fn layout_is_deterministic() {
        let mol = smiles::parse(DORAVIRINE_SMILES).unwrap();
        assert_eq!(compute(&mol), compute(&mol));
    }

    #[test]
    fn layout_has_no_coincident_atoms() {
        let mol = smiles::parse(DORAVIRINE_SMILES).unwrap();
        let points = compute(&mol);
        for i in 0..points.len() {
            for j in (i + 1)..points.len() {
                assert!(points[i].distance(points[j]) > 0.2, "atoms {i} and {j} overlap");
            }
        }
    }

    #[test]
    fn fitted_points_stay_inside_margins() {
        let mol = smiles::parse(DORAVIRINE_SMILES).unwrap();
        let pixels = fit_to_canvas(&compute(&mol), 350, 300, 20.0, 40.0);
        for (x, y) in pixels {
            assert!((19..=331).contains(&x), "x = {x}");
            assert!((19..=281).contains(&y), "y = {y}");
        }
    }

    #[test]
    fn single_atom_is_centred() {
        let mol = smiles::parse("C").unwrap();
        let pixels = fit_to_canvas(&compute(&mol), 350, 300, 20.0, 40.0);
        assert_eq!(pixels, vec![(175, 150)]);
    }
}

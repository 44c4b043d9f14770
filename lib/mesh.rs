//! Brillouin-zone sampling: straight k-paths along the field direction.

use std::f64::consts::{ PI, TAU };
use ndarray::{ self as nd, s };
use crate::{
    config::{ Alignment, BzGeometry, Gauge, Params },
    error::{ Error, Result },
};

/// Relative slack on the hexagon edges; points on an edge count as inside.
const HEX_TOL: f64 = 1e-12;

/// k-point sampling of one parameter combination.
#[derive(Clone, Debug, PartialEq)]
pub struct KMesh {
    /// Unit vector along the field.
    pub e_dir: [f64; 2],
    /// Unit vector orthogonal to the field, `(e_dir.y, -e_dir.x)`.
    pub e_ort: [f64; 2],
    /// Spacing of neighboring points along a path.
    pub dk: f64,
    /// Integration weight of a single k-point, including `1/(2π)²`.
    pub kweight: f64,
    /// Path points, shape `(paths, points per path, 2)`.
    pub paths: nd::Array3<f64>,
}

impl KMesh {
    pub fn n_paths(&self) -> usize { self.paths.shape()[0] }

    pub fn points_per_path(&self) -> usize { self.paths.shape()[1] }

    pub fn path(&self, j: usize) -> nd::ArrayView2<'_, f64> {
        self.paths.slice(s![j, .., ..])
    }

    /// All points as a flat `(paths × points, 2)` array.
    pub fn mesh(&self) -> nd::Array2<f64> {
        let p = self.points_per_path();
        nd::Array2::from_shape_fn(
            (self.n_paths() * p, 2),
            |(i, c)| self.paths[[i / p, i % p, c]],
        )
    }

    /// Re-slice the mesh so that every point forms its own path.
    pub fn into_single_points(self) -> Self {
        let p = self.points_per_path();
        let paths = nd::Array3::from_shape_fn(
            (self.n_paths() * p, 1, 2),
            |(i, _, c)| self.paths[[i / p, i % p, c]],
        );
        Self { paths, ..self }
    }
}

/// Projection of `k` on a direction.
pub fn project(k: [f64; 2], dir: [f64; 2]) -> f64 { k[0] * dir[0] + k[1] * dir[1] }

/// `linspace(-1/2 + 1/(2n), 1/2 - 1/(2n), n)`: centered Monkhorst-Pack
/// fractions.
pub fn mp_fractions(n: usize) -> nd::Array1<f64> {
    let h = 0.5 / n as f64;
    nd::Array1::linspace(-0.5 + h, 0.5 - h, n)
}

/// Build the k-paths of a parameter combination.
pub fn make_bz(params: &Params) -> Result<KMesh> {
    let mesh = match params.bz {
        BzGeometry::Rectangle { length_e_dir, length_ortho, angle } => {
            if length_e_dir <= 0.0 || length_ortho < 0.0 {
                return Err(Error::config("path lengths must be positive"));
            }
            rect_mesh(params.Nk1, params.Nk2, length_e_dir, length_ortho, angle)
        },
        BzGeometry::Hexagon { a, align } => {
            hex_mesh(params.Nk1, params.Nk2, a, align)
        },
    };
    if params.point_parallel {
        if params.gauge != Gauge::Velocity {
            return Err(Error::config(
                "parallelization over k-points requires the velocity gauge"));
        }
        Ok(mesh.into_single_points())
    } else {
        Ok(mesh)
    }
}

/// `Nk2` parallel paths of `Nk1` points each, centered on Γ, spanning
/// `length_e_dir` along the field and `length_ortho` across it.
pub fn rect_mesh(
    Nk1: usize,
    Nk2: usize,
    length_e_dir: f64,
    length_ortho: f64,
    angle: f64,
) -> KMesh
{
    let e_dir = [angle.cos(), angle.sin()];
    let e_ort = [e_dir[1], -e_dir[0]];
    let alpha = mp_fractions(Nk1);
    let beta = if Nk2 == 1 { nd::array![0.0] } else { mp_fractions(Nk2) };
    let paths = nd::Array3::from_shape_fn((Nk2, Nk1, 2), |(j, i, c)| {
        alpha[i] * length_e_dir * e_dir[c] + beta[j] * length_ortho * e_ort[c]
    });
    let dk = length_e_dir / Nk1 as f64;
    let kweight
        = length_e_dir * length_ortho
        / (Nk1 * Nk2) as f64
        / TAU.powi(2);
    KMesh { e_dir, e_ort, dk, kweight, paths }
}

/// Reciprocal basis `(b1, b2)` of a hexagonal lattice with constant `a`,
/// oriented so that the zone has K points on the x axis.
pub fn hex_reciprocal(a: f64) -> ([f64; 2], [f64; 2]) {
    let s3 = 3.0_f64.sqrt();
    ([TAU / a, -TAU / (s3 * a)], [0.0, 2.0 * TAU / (s3 * a)])
}

/// Area of the hexagonal zone.
pub fn hex_area(a: f64) -> f64 { 8.0 * PI.powi(2) / (3.0_f64.sqrt() * a.powi(2)) }

/// Whether `k` lies in the first Brillouin zone (edges included).
pub fn in_hexagon(k: [f64; 2], a: f64) -> bool {
    let s3 = 3.0_f64.sqrt();
    let y_max = PI / (s3 * a) * 2.0 * (1.0 + HEX_TOL);
    let side_max = 4.0 * PI / (s3 * a) * (1.0 + HEX_TOL);
    k[1].abs() <= y_max && s3 * k[0].abs() + k[1].abs() <= side_max
}

/// Translate `k` by reciprocal lattice vectors until it lies in the first
/// Brillouin zone.
///
/// Each translation crosses the Bragg plane of the violated edge, which
/// strictly decreases `|k|`.
pub fn fold_into_hexagon(k: [f64; 2], a: f64) -> [f64; 2] {
    let s3 = 3.0_f64.sqrt();
    let (b1, b2) = hex_reciprocal(a);
    let b12 = [b1[0] + b2[0], b1[1] + b2[1]];
    let y_max = 2.0 * PI / (s3 * a) * (1.0 + HEX_TOL);
    let side_max = 4.0 * PI / (s3 * a) * (1.0 + HEX_TOL);
    let sub = |p: [f64; 2], v: [f64; 2]| [p[0] - v[0], p[1] - v[1]];
    let add = |p: [f64; 2], v: [f64; 2]| [p[0] + v[0], p[1] + v[1]];
    let mut p = k;
    while !in_hexagon(p, a) {
        p = if p[1] > y_max {
            sub(p, b2)
        } else if p[1] < -y_max {
            add(p, b2)
        } else if s3 * p[0] + p[1] > side_max {
            sub(p, b12)
        } else if -s3 * p[0] + p[1] < -side_max {
            sub(p, b1)
        } else if s3 * p[0] + p[1] < -side_max {
            add(p, b12)
        } else {
            add(p, b1)
        };
    }
    p
}

/// `Nk2` paths of `Nk1` points, each spanning one full reciprocal period
/// along the field and folded into the hexagonal zone, so that periodic
/// neighbours along a path are exact.
///
/// `M` alignment runs paths along Γ–M (field at -30°), `K` alignment along
/// Γ–K (field along x).
pub fn hex_mesh(Nk1: usize, Nk2: usize, a: f64, align: Alignment) -> KMesh {
    let (b1, b2) = hex_reciprocal(a);
    let (g1, g2) = match align {
        Alignment::M => (b1, b2),
        Alignment::K => (
            [2.0 * b1[0] + b2[0], 2.0 * b1[1] + b2[1]],
            [b1[0] + b2[0], b1[1] + b2[1]],
        ),
    };
    let norm = (g1[0].powi(2) + g1[1].powi(2)).sqrt();
    let e_dir = [g1[0] / norm, g1[1] / norm];
    let e_ort = [e_dir[1], -e_dir[0]];
    let alpha = mp_fractions(Nk1);
    let beta = mp_fractions(Nk2);
    let mut paths: nd::Array3<f64> = nd::Array3::zeros((Nk2, Nk1, 2));
    for (j, bj) in beta.iter().enumerate() {
        for (i, ai) in alpha.iter().enumerate() {
            let k = [ai * g1[0] + bj * g2[0], ai * g1[1] + bj * g2[1]];
            let k = fold_into_hexagon(k, a);
            paths[[j, i, 0]] = k[0];
            paths[[j, i, 1]] = k[1];
        }
    }
    let dk = norm / Nk1 as f64;
    let kweight = hex_area(a) / (Nk1 * Nk2) as f64 / TAU.powi(2);
    KMesh { e_dir, e_ort, dk, kweight, paths }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn hexagon_points_are_inside() {
        let a = 8.28834;
        for align in [Alignment::K, Alignment::M] {
            let mesh = hex_mesh(24, 9, a, align);
            assert_eq!(mesh.paths.shape(), &[9, 24, 2]);
            for p in mesh.mesh().outer_iter() {
                assert!(in_hexagon([p[0], p[1]], a), "{:?} outside", p);
            }
        }
    }

    #[test]
    fn hexagon_weights_cover_zone() {
        let a = 4.0;
        let mesh = hex_mesh(10, 6, a, Alignment::K);
        assert_relative_eq!(
            mesh.kweight * 60.0 * TAU.powi(2),
            hex_area(a),
            max_relative = 1e-12,
        );
        assert_relative_eq!(mesh.e_dir[0], 1.0, max_relative = 1e-12);
    }

    #[test]
    fn folding_is_identity_inside() {
        let a = 3.0;
        let k = [0.1, -0.2];
        assert_eq!(fold_into_hexagon(k, a), k);
        let (b1, b2) = hex_reciprocal(a);
        let far = [k[0] + 2.0 * b1[0] - b2[0], k[1] + 2.0 * b1[1] - b2[1]];
        let back = fold_into_hexagon(far, a);
        assert_relative_eq!(back[0], k[0], epsilon = 1e-12);
        assert_relative_eq!(back[1], k[1], epsilon = 1e-12);
    }

    #[test]
    fn rectangle_paths_stay_within_length() {
        let (le, lo) = (4.6, 0.38);
        let mesh = rect_mesh(20, 2, le, lo, 0.3);
        assert_eq!(mesh.n_paths(), 2);
        assert_eq!(mesh.points_per_path(), 20);
        for p in mesh.mesh().outer_iter() {
            let k = [p[0], p[1]];
            assert!(project(k, mesh.e_dir).abs() <= le / 2.0);
            assert!(project(k, mesh.e_ort).abs() <= lo / 2.0);
        }
        assert_relative_eq!(mesh.dk, 0.23, max_relative = 1e-12);
    }

    #[test]
    fn single_path_rectangle_sits_on_gamma() {
        let mesh = rect_mesh(5, 1, 1.0, 0.1, 0.0);
        for p in mesh.path(0).outer_iter() {
            assert_eq!(p[1], 0.0);
        }
    }

    #[test]
    fn point_split_keeps_points() {
        let mesh = rect_mesh(4, 3, 1.0, 1.0, 0.0);
        let flat = mesh.mesh();
        let single = mesh.into_single_points();
        assert_eq!(single.paths.shape(), &[12, 1, 2]);
        assert_eq!(single.mesh(), flat);
    }
}

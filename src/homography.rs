//! Projective transforms between a candidate scan and the reference form:
//! direct linear fitting, robust RANSAC estimation, and point projection.

use imageproc::geometric_transformations::Projection;
use imageproc::point::Point;
use nalgebra::{DMatrix, Matrix3, Vector3};
use rand::prelude::*;
use thiserror::Error;

use crate::geometry::{distance_from_point_to_point, has_collinear_triple};

const EPS: f64 = 1e-12;

/// Minimum number of correspondences that determine a homography.
pub const MIN_CORRESPONDENCES: usize = 4;

/// Triangles smaller than this (in px²) make a sample degenerate.
const MIN_SAMPLE_TRIANGLE_AREA: f64 = 1.0;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum HomographyError {
    #[error("{0} correspondences, at least 4 are required")]
    TooFewCorrespondences(usize),
    #[error("source and destination point counts differ ({0} vs {1})")]
    MismatchedPointCounts(usize, usize),
    #[error("no non-degenerate sample found in {0} iterations")]
    Degenerate(usize),
    #[error("best model has {0} inliers, at least {1} are required")]
    NoConsensus(usize, usize),
}

/// A 3×3 projective transform, normalized so that `h[(2, 2)] == 1`
/// whenever that entry is non-zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Homography(Matrix3<f64>);

impl Homography {
    /// Wraps a matrix, rejecting singular or non-finite ones.
    pub fn from_matrix(m: Matrix3<f64>) -> Option<Self> {
        if m.iter().any(|v| !v.is_finite()) {
            return None;
        }
        let scale = if m[(2, 2)].abs() > EPS {
            m[(2, 2)]
        } else {
            m.norm()
        };
        if scale.abs() <= EPS {
            return None;
        }
        let m = m / scale;
        let det = m.determinant();
        if !det.is_finite() || det.abs() <= EPS {
            return None;
        }
        Some(Self(m))
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.0
    }

    /// Maps a point through the transform. `None` for points that land on
    /// the line at infinity.
    pub fn project(&self, p: &Point<f64>) -> Option<Point<f64>> {
        let v = self.0 * Vector3::new(p.x, p.y, 1.0);
        let w = v[2];
        if !w.is_finite() || w.abs() <= EPS {
            return None;
        }
        let out = Point::new(v[0] / w, v[1] / w);
        if out.x.is_finite() && out.y.is_finite() {
            Some(out)
        } else {
            None
        }
    }

    /// Distance between the projection of `src` and `dst`; infinite when
    /// `src` cannot be projected.
    pub fn reprojection_error(&self, src: &Point<f64>, dst: &Point<f64>) -> f64 {
        self.project(src)
            .map(|p| distance_from_point_to_point(&p, dst))
            .unwrap_or(f64::INFINITY)
    }

    /// Converts into the single-precision form imageproc warps with.
    pub fn to_projection(&self) -> Option<Projection> {
        let m = &self.0;
        Projection::from_matrix([
            m[(0, 0)] as f32,
            m[(0, 1)] as f32,
            m[(0, 2)] as f32,
            m[(1, 0)] as f32,
            m[(1, 1)] as f32,
            m[(1, 2)] as f32,
            m[(2, 0)] as f32,
            m[(2, 1)] as f32,
            m[(2, 2)] as f32,
        ])
    }
}

/// Similarity transform moving the centroid to the origin with mean
/// distance √2 from it.
fn normalizing_transform(points: &[Point<f64>]) -> Option<Matrix3<f64>> {
    let n = points.len() as f64;
    let mx = points.iter().map(|p| p.x).sum::<f64>() / n;
    let my = points.iter().map(|p| p.y).sum::<f64>() / n;
    let mean_dist = points
        .iter()
        .map(|p| ((p.x - mx).powi(2) + (p.y - my).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    if mean_dist <= EPS {
        return None;
    }
    let s = std::f64::consts::SQRT_2 / mean_dist;
    Some(Matrix3::new(s, 0.0, -s * mx, 0.0, s, -s * my, 0.0, 0.0, 1.0))
}

fn apply(t: &Matrix3<f64>, p: &Point<f64>) -> Point<f64> {
    let v = t * Vector3::new(p.x, p.y, 1.0);
    Point::new(v[0] / v[2], v[1] / v[2])
}

/// Least-squares homography mapping `src[i]` onto `dst[i]` with the
/// normalized direct linear transform.
pub fn fit_homography_dlt(src: &[Point<f64>], dst: &[Point<f64>]) -> Option<Homography> {
    if src.len() != dst.len() || src.len() < MIN_CORRESPONDENCES {
        return None;
    }

    let t_src = normalizing_transform(src)?;
    let t_dst = normalizing_transform(dst)?;

    // padded to at least 9 rows so the SVD yields the full right null space
    let rows = (2 * src.len()).max(9);
    let mut a = DMatrix::<f64>::zeros(rows, 9);
    for (i, (s, d)) in src.iter().zip(dst).enumerate() {
        let s = apply(&t_src, s);
        let d = apply(&t_dst, d);
        let r = 2 * i;
        a[(r, 0)] = -s.x;
        a[(r, 1)] = -s.y;
        a[(r, 2)] = -1.0;
        a[(r, 6)] = d.x * s.x;
        a[(r, 7)] = d.x * s.y;
        a[(r, 8)] = d.x;
        a[(r + 1, 3)] = -s.x;
        a[(r + 1, 4)] = -s.y;
        a[(r + 1, 5)] = -1.0;
        a[(r + 1, 6)] = d.y * s.x;
        a[(r + 1, 7)] = d.y * s.y;
        a[(r + 1, 8)] = d.y;
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let (smallest, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let h = v_t.row(smallest);
    let h_normalized = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);

    let t_dst_inv = t_dst.try_inverse()?;
    Homography::from_matrix(t_dst_inv * h_normalized * t_src)
}

#[derive(Debug, Clone, Copy)]
pub struct RansacParams {
    /// Upper bound on sampling iterations.
    pub max_iters: usize,
    /// Reprojection error (px) below which a correspondence is an inlier.
    pub inlier_threshold: f64,
    /// Probability of drawing at least one outlier-free sample, used to stop
    /// early once a good model is found.
    pub confidence: f64,
    pub min_inliers: usize,
    pub seed: u64,
}

impl Default for RansacParams {
    fn default() -> Self {
        Self {
            max_iters: 2000,
            inlier_threshold: 3.0,
            confidence: 0.995,
            min_inliers: MIN_CORRESPONDENCES,
            seed: 0x5eed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RansacResult {
    pub homography: Homography,
    pub inlier_mask: Vec<bool>,
    pub n_inliers: usize,
    pub iterations: usize,
    pub mean_inlier_error: f64,
}

/// Sample `k` distinct indices from `0..n` using a partial Fisher–Yates
/// shuffle.
fn sample_indices(rng: &mut impl Rng, n: usize, k: usize) -> Vec<usize> {
    debug_assert!(k <= n);
    let mut indices: Vec<usize> = (0..n).collect();
    for i in 0..k {
        let j = rng.gen_range(i..n);
        indices.swap(i, j);
    }
    indices.truncate(k);
    indices
}

fn inliers(
    h: &Homography,
    src: &[Point<f64>],
    dst: &[Point<f64>],
    threshold: f64,
) -> (Vec<bool>, usize, f64) {
    let mut mask = vec![false; src.len()];
    let mut count = 0;
    let mut error_sum = 0.0;
    for (i, (s, d)) in src.iter().zip(dst).enumerate() {
        let err = h.reprojection_error(s, d);
        if err <= threshold {
            mask[i] = true;
            count += 1;
            error_sum += err;
        }
    }
    let mean = if count > 0 {
        error_sum / count as f64
    } else {
        f64::NAN
    };
    (mask, count, mean)
}

/// Number of iterations needed to see an all-inlier sample with the given
/// confidence when `inlier_ratio` of the data are inliers.
fn required_iterations(inlier_ratio: f64, confidence: f64, max_iters: usize) -> usize {
    let all_inliers = inlier_ratio.powi(MIN_CORRESPONDENCES as i32);
    if all_inliers >= 1.0 - EPS {
        return 1;
    }
    if all_inliers <= EPS {
        return max_iters;
    }
    let k = (1.0 - confidence).ln() / (1.0 - all_inliers).ln();
    if k.is_finite() {
        (k.ceil() as usize).clamp(1, max_iters)
    } else {
        max_iters
    }
}

/// Fits a homography mapping `src` onto `dst` that tolerates outliers among
/// the correspondences. The final model is refit on all inliers of the best
/// hypothesis.
pub fn fit_homography_ransac(
    src: &[Point<f64>],
    dst: &[Point<f64>],
    params: &RansacParams,
) -> Result<RansacResult, HomographyError> {
    if src.len() != dst.len() {
        return Err(HomographyError::MismatchedPointCounts(src.len(), dst.len()));
    }
    let n = src.len();
    if n < MIN_CORRESPONDENCES {
        return Err(HomographyError::TooFewCorrespondences(n));
    }

    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut best: Option<(Homography, usize)> = None;
    let mut iterations_needed = params.max_iters.max(1);
    let mut iterations = 0;

    while iterations < iterations_needed {
        iterations += 1;

        let sample = sample_indices(&mut rng, n, MIN_CORRESPONDENCES);
        let sample_src: Vec<Point<f64>> = sample.iter().map(|&i| src[i]).collect();
        let sample_dst: Vec<Point<f64>> = sample.iter().map(|&i| dst[i]).collect();
        if has_collinear_triple(&sample_src, MIN_SAMPLE_TRIANGLE_AREA)
            || has_collinear_triple(&sample_dst, MIN_SAMPLE_TRIANGLE_AREA)
        {
            continue;
        }

        let Some(h) = fit_homography_dlt(&sample_src, &sample_dst) else {
            continue;
        };

        let (_, count, _) = inliers(&h, src, dst, params.inlier_threshold);
        if best.map_or(true, |(_, best_count)| count > best_count) {
            best = Some((h, count));
            iterations_needed = required_iterations(
                count as f64 / n as f64,
                params.confidence,
                params.max_iters.max(1),
            )
            .max(1);
        }
    }

    let Some((best_h, best_count)) = best else {
        return Err(HomographyError::Degenerate(iterations));
    };
    if best_count < params.min_inliers.max(MIN_CORRESPONDENCES) {
        return Err(HomographyError::NoConsensus(
            best_count,
            params.min_inliers.max(MIN_CORRESPONDENCES),
        ));
    }

    let (best_mask, _, _) = inliers(&best_h, src, dst, params.inlier_threshold);
    let inlier_src: Vec<Point<f64>> = src
        .iter()
        .zip(&best_mask)
        .filter(|&(_, &m)| m)
        .map(|(p, _)| *p)
        .collect();
    let inlier_dst: Vec<Point<f64>> = dst
        .iter()
        .zip(&best_mask)
        .filter(|&(_, &m)| m)
        .map(|(p, _)| *p)
        .collect();

    // keep the refit only if it does not lose support
    let homography = match fit_homography_dlt(&inlier_src, &inlier_dst) {
        Some(refit) if inliers(&refit, src, dst, params.inlier_threshold).1 >= best_count => {
            refit
        }
        _ => best_h,
    };

    let (inlier_mask, n_inliers, mean_inlier_error) =
        inliers(&homography, src, dst, params.inlier_threshold);

    Ok(RansacResult {
        homography,
        inlier_mask,
        n_inliers,
        iterations,
        mean_inlier_error,
    })
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    fn known_homography() -> Homography {
        Homography::from_matrix(Matrix3::new(
            0.98, -0.05, 12.0, 0.04, 1.02, -7.0, 1.0e-5, -2.0e-5, 1.0,
        ))
        .unwrap()
    }

    fn grid_points() -> Vec<Point<f64>> {
        let mut points = vec![];
        for i in 0..6 {
            for j in 0..5 {
                points.push(Point::new(
                    20.0 + 53.0 * i as f64 + (j * 3) as f64,
                    15.0 + 41.0 * j as f64 + (i * i) as f64,
                ));
            }
        }
        points
    }

    fn assert_same_mapping(a: &Homography, b: &Homography, points: &[Point<f64>], tol: f64) {
        for p in points {
            let pa = a.project(p).unwrap();
            let pb = b.project(p).unwrap();
            assert!(
                distance_from_point_to_point(&pa, &pb) < tol,
                "{:?} vs {:?}",
                pa,
                pb
            );
        }
    }

    #[test]
    fn dlt_recovers_exact_homography() {
        let h = known_homography();
        let src = grid_points();
        let dst: Vec<Point<f64>> = src.iter().map(|p| h.project(p).unwrap()).collect();
        let fitted = fit_homography_dlt(&src, &dst).unwrap();
        assert_same_mapping(&fitted, &h, &src, 1e-6);
        assert_relative_eq!(fitted.matrix()[(2, 2)], 1.0);
    }

    #[test]
    fn dlt_from_minimal_sample() {
        let src = [
            Point::new(0.0, 0.0),
            Point::new(100.0, 0.0),
            Point::new(100.0, 50.0),
            Point::new(0.0, 50.0),
        ];
        let dst = [
            Point::new(3.0, 4.0),
            Point::new(105.0, 2.0),
            Point::new(101.0, 57.0),
            Point::new(-1.0, 52.0),
        ];
        let fitted = fit_homography_dlt(&src, &dst).unwrap();
        for (s, d) in src.iter().zip(&dst) {
            assert!(fitted.reprojection_error(s, d) < 1e-6);
        }
    }

    #[test]
    fn dlt_rejects_coincident_points() {
        let src = [Point::new(5.0, 5.0); 4];
        let dst = [Point::new(1.0, 1.0); 4];
        assert!(fit_homography_dlt(&src, &dst).is_none());
    }

    #[test]
    fn ransac_ignores_outliers() {
        let h = known_homography();
        let src = grid_points();
        let mut dst: Vec<Point<f64>> = src.iter().map(|p| h.project(p).unwrap()).collect();
        // corrupt a fifth of the correspondences
        for (i, d) in dst.iter_mut().enumerate() {
            if i % 5 == 2 {
                d.x += 40.0 + i as f64;
                d.y -= 25.0;
            }
        }

        let result = fit_homography_ransac(&src, &dst, &RansacParams::default()).unwrap();
        assert_eq!(result.n_inliers, 24);
        for (i, inlier) in result.inlier_mask.iter().enumerate() {
            assert_eq!(*inlier, i % 5 != 2);
        }
        assert_same_mapping(&result.homography, &h, &src, 1e-3);
        assert!(result.mean_inlier_error < 1e-3);
    }

    #[test]
    fn ransac_is_reproducible() {
        let h = known_homography();
        let src = grid_points();
        let mut dst: Vec<Point<f64>> = src.iter().map(|p| h.project(p).unwrap()).collect();
        dst[3].x += 30.0;
        dst[11].y += 30.0;
        let params = RansacParams::default();
        let a = fit_homography_ransac(&src, &dst, &params).unwrap();
        let b = fit_homography_ransac(&src, &dst, &params).unwrap();
        assert_eq!(a.homography, b.homography);
        assert_eq!(a.iterations, b.iterations);
    }

    #[test]
    fn ransac_requires_four_points() {
        let src = grid_points()[..3].to_vec();
        assert_eq!(
            fit_homography_ransac(&src, &src, &RansacParams::default()).unwrap_err(),
            HomographyError::TooFewCorrespondences(3)
        );
    }

    #[test]
    fn ransac_fails_on_collinear_points() {
        let src: Vec<Point<f64>> = (0..10).map(|i| Point::new(i as f64 * 10.0, 5.0)).collect();
        let params = RansacParams {
            max_iters: 50,
            ..RansacParams::default()
        };
        assert_eq!(
            fit_homography_ransac(&src, &src, &params).unwrap_err(),
            HomographyError::Degenerate(50)
        );
    }

    #[test]
    fn converts_to_projection_and_rejects_singular_matrices() {
        let h = known_homography();
        assert!(h.to_projection().is_some());
        assert!(Homography::from_matrix(Matrix3::zeros()).is_none());
    }
}

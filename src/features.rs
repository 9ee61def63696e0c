//! Oriented FAST keypoints with rotated BRIEF descriptors (ORB).
//!
//! Keypoints are FAST-9 corners found on every level of a scale pyramid,
//! thinned by non-maximum suppression and a per-level budget. Each keypoint
//! gets an orientation from the intensity centroid of its patch, and a
//! 256-bit descriptor from intensity comparisons over a smoothed copy of the
//! level, with the comparison pattern rotated by that orientation.

use std::cmp::Ordering;
use std::sync::OnceLock;

use image::{imageops, GrayImage};
use imageproc::corners::{corners_fast9, Corner};
use imageproc::filter::gaussian_blur_f32;
use logging_timer::time;
use rand::prelude::*;
use rayon::prelude::*;

pub const DESCRIPTOR_BYTES: usize = 32;
const DESCRIPTOR_BITS: usize = DESCRIPTOR_BYTES * 8;

/// Radius of the disc sampled by the BRIEF pattern.
const PATTERN_RADIUS: i32 = 13;

/// Radius of the disc used to measure keypoint orientation.
const ORIENTATION_RADIUS: i32 = 15;

/// Keypoints closer than this to the level border are dropped so the
/// orientation disc always fits.
const BORDER: u32 = ORIENTATION_RADIUS as u32 + 1;

pub type Descriptor = [u8; DESCRIPTOR_BYTES];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    /// Position in full-resolution image coordinates.
    pub x: f32,
    pub y: f32,
    pub response: f32,
    /// Orientation in radians.
    pub angle: f32,
    pub octave: usize,
}

/// Keypoints and their descriptors; `descriptors[i]` describes
/// `keypoints[i]`.
#[derive(Debug, Clone, Default)]
pub struct Features {
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Vec<Descriptor>,
}

impl Features {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrbParams {
    /// Upper bound on the number of keypoints kept per image.
    pub max_features: usize,
    pub fast_threshold: u8,
    pub pyramid_levels: usize,
    /// Downscale factor between consecutive pyramid levels.
    pub scale_factor: f32,
    /// Corners within this many pixels of a stronger one are suppressed.
    pub nms_radius: u32,
    /// Smoothing applied before sampling descriptors.
    pub blur_sigma: f32,
}

impl Default for OrbParams {
    fn default() -> Self {
        Self {
            max_features: 500,
            fast_threshold: 20,
            pyramid_levels: 8,
            scale_factor: 1.2,
            nms_radius: 3,
            blur_sigma: 2.0,
        }
    }
}

/// The BRIEF comparison pattern: 256 pairs of offsets within a disc around
/// the keypoint. Generated from a fixed seed so every image in a run is
/// described with the same pattern.
fn brief_pattern() -> &'static [(i8, i8, i8, i8); DESCRIPTOR_BITS] {
    static PATTERN: OnceLock<[(i8, i8, i8, i8); DESCRIPTOR_BITS]> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let mut rng = StdRng::seed_from_u64(0x0b_1e_f0_0d);
        let mut point = || loop {
            let x = rng.gen_range(-PATTERN_RADIUS..=PATTERN_RADIUS);
            let y = rng.gen_range(-PATTERN_RADIUS..=PATTERN_RADIUS);
            if x * x + y * y <= PATTERN_RADIUS * PATTERN_RADIUS {
                return (x as i8, y as i8);
            }
        };
        let mut pattern = [(0i8, 0i8, 0i8, 0i8); DESCRIPTOR_BITS];
        for pair in pattern.iter_mut() {
            let (x1, y1) = point();
            let (mut x2, mut y2) = point();
            while (x1, y1) == (x2, y2) {
                (x2, y2) = point();
            }
            *pair = (x1, y1, x2, y2);
        }
        pattern
    })
}

/// Number of keypoints each pyramid level may contribute. Levels get a share
/// proportional to their area.
fn level_budgets(max_features: usize, levels: usize, scale_factor: f32) -> Vec<usize> {
    if levels == 0 {
        return vec![];
    }
    let factor = 1.0 / (scale_factor * scale_factor).max(1.0);
    let weights: Vec<f32> = (0..levels).map(|i| factor.powi(i as i32)).collect();
    let total: f32 = weights.iter().sum();
    let mut budgets: Vec<usize> = weights
        .iter()
        .map(|w| (max_features as f32 * w / total).floor() as usize)
        .collect();
    let assigned: usize = budgets.iter().sum();
    budgets[0] += max_features.saturating_sub(assigned);
    budgets
}

fn build_pyramid(image: &GrayImage, params: &OrbParams) -> Vec<GrayImage> {
    let min_side = 2 * BORDER + 1;
    let mut pyramid: Vec<GrayImage> = Vec::with_capacity(params.pyramid_levels);
    if image.width() < min_side || image.height() < min_side || params.pyramid_levels == 0 {
        return pyramid;
    }
    pyramid.push(image.clone());

    for level in 1..params.pyramid_levels {
        let scale = params.scale_factor.powi(level as i32);
        let width = (image.width() as f32 / scale).round() as u32;
        let height = (image.height() as f32 / scale).round() as u32;
        if width < min_side || height < min_side {
            break;
        }
        pyramid.push(imageops::resize(
            image,
            width,
            height,
            imageops::FilterType::Triangle,
        ));
    }

    pyramid
}

/// Keeps the strongest corners, dropping any within `radius` (Chebyshev
/// distance) of an already kept one. Ties in strength are broken by
/// position so the result does not depend on detection order.
fn suppress_non_maxima(
    mut corners: Vec<Corner>,
    width: u32,
    height: u32,
    radius: u32,
    budget: usize,
) -> Vec<Corner> {
    corners.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(a.y.cmp(&b.y))
            .then(a.x.cmp(&b.x))
    });

    let mut occupied = vec![false; (width * height) as usize];
    let mut kept = Vec::with_capacity(budget.min(corners.len()));
    for corner in corners {
        if kept.len() >= budget {
            break;
        }
        let (cx, cy) = (corner.x, corner.y);
        if occupied[(cy * width + cx) as usize] {
            continue;
        }
        kept.push(corner);

        let x0 = cx.saturating_sub(radius);
        let x1 = (cx + radius).min(width - 1);
        let y0 = cy.saturating_sub(radius);
        let y1 = (cy + radius).min(height - 1);
        for y in y0..=y1 {
            for x in x0..=x1 {
                occupied[(y * width + x) as usize] = true;
            }
        }
    }
    kept
}

/// Orientation of the patch around `(x, y)` from its intensity centroid.
fn intensity_centroid_angle(image: &GrayImage, x: u32, y: u32) -> f32 {
    let (cx, cy) = (x as i32, y as i32);
    let mut m01 = 0.0f32;
    let mut m10 = 0.0f32;
    for dy in -ORIENTATION_RADIUS..=ORIENTATION_RADIUS {
        for dx in -ORIENTATION_RADIUS..=ORIENTATION_RADIUS {
            if dx * dx + dy * dy > ORIENTATION_RADIUS * ORIENTATION_RADIUS {
                continue;
            }
            let intensity = image.get_pixel((cx + dx) as u32, (cy + dy) as u32)[0] as f32;
            m10 += dx as f32 * intensity;
            m01 += dy as f32 * intensity;
        }
    }
    m01.atan2(m10)
}

fn sample_clamped(image: &GrayImage, x: i32, y: i32) -> u8 {
    let x = x.clamp(0, image.width() as i32 - 1) as u32;
    let y = y.clamp(0, image.height() as i32 - 1) as u32;
    image.get_pixel(x, y)[0]
}

/// Rotated BRIEF descriptor of the (smoothed) level image at `(x, y)`.
fn describe(smoothed: &GrayImage, x: u32, y: u32, angle: f32) -> Descriptor {
    let (sin, cos) = angle.sin_cos();
    let (cx, cy) = (x as i32, y as i32);
    let rotate = |dx: i8, dy: i8| {
        let (dx, dy) = (dx as f32, dy as f32);
        (
            cx + (dx * cos - dy * sin).round() as i32,
            cy + (dx * sin + dy * cos).round() as i32,
        )
    };

    let mut descriptor = [0u8; DESCRIPTOR_BYTES];
    for (bit, &(x1, y1, x2, y2)) in brief_pattern().iter().enumerate() {
        let (ax, ay) = rotate(x1, y1);
        let (bx, by) = rotate(x2, y2);
        if sample_clamped(smoothed, ax, ay) < sample_clamped(smoothed, bx, by) {
            descriptor[bit / 8] |= 1 << (bit % 8);
        }
    }
    descriptor
}

fn detect_level(
    level: &GrayImage,
    octave: usize,
    budget: usize,
    params: &OrbParams,
    full: (u32, u32),
) -> Vec<(Keypoint, Descriptor)> {
    if budget == 0 {
        return vec![];
    }
    let (width, height) = level.dimensions();
    let corners: Vec<Corner> = corners_fast9(level, params.fast_threshold)
        .into_iter()
        .filter(|c| {
            c.x >= BORDER && c.y >= BORDER && c.x + BORDER < width && c.y + BORDER < height
        })
        .collect();
    let corners = suppress_non_maxima(corners, width, height, params.nms_radius, budget);
    if corners.is_empty() {
        return vec![];
    }

    let smoothed = gaussian_blur_f32(level, params.blur_sigma);
    let scale_x = full.0 as f32 / width as f32;
    let scale_y = full.1 as f32 / height as f32;

    corners
        .iter()
        .map(|corner| {
            let angle = intensity_centroid_angle(level, corner.x, corner.y);
            let keypoint = Keypoint {
                x: corner.x as f32 * scale_x,
                y: corner.y as f32 * scale_y,
                response: corner.score,
                angle,
                octave,
            };
            (keypoint, describe(&smoothed, corner.x, corner.y, angle))
        })
        .collect()
}

#[time]
/// Detects up to `params.max_features` ORB keypoints in `image` and computes
/// their descriptors.
pub fn detect_and_compute(image: &GrayImage, params: &OrbParams) -> Features {
    let pyramid = build_pyramid(image, params);
    let budgets = level_budgets(params.max_features, pyramid.len(), params.scale_factor);

    let per_level: Vec<Vec<(Keypoint, Descriptor)>> = pyramid
        .par_iter()
        .zip(budgets.par_iter())
        .enumerate()
        .map(|(octave, (level, &budget))| {
            detect_level(level, octave, budget, params, image.dimensions())
        })
        .collect();

    let (keypoints, descriptors): (Vec<Keypoint>, Vec<Descriptor>) =
        per_level.into_iter().flatten().unzip();
    Features {
        keypoints,
        descriptors,
    }
}

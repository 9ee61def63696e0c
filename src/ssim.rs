//! Structural similarity (SSIM) between two equally sized grayscale patches,
//! backed by `image_compare`'s mean SSIM over 8×8 tiles.

use image::GrayImage;
use image_compare::{Algorithm, CompareError};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SsimError {
    #[error("patch sizes differ: {0:?} vs {1:?}")]
    DimensionMismatch((u32, u32), (u32, u32)),
    #[error("empty patch")]
    Empty,
    #[error("similarity calculation failed: {0}")]
    Calculation(String),
}

#[derive(Debug, Clone)]
pub struct SsimComparison {
    /// Area-weighted mean of the per-tile SSIM values, in [-1, 1].
    pub score: f64,
    /// Per-pixel similarity rendered as gray: 0 for SSIM <= 0, 255 for 1.
    pub map: GrayImage,
}

/// Compares `a` against `b`.
pub fn compare(a: &GrayImage, b: &GrayImage) -> Result<SsimComparison, SsimError> {
    if a.dimensions() != b.dimensions() {
        return Err(SsimError::DimensionMismatch(a.dimensions(), b.dimensions()));
    }
    // image_compare indexes `width - 1`, so empty patches never reach it
    if a.width() == 0 || a.height() == 0 {
        return Err(SsimError::Empty);
    }

    let similarity = image_compare::gray_similarity_structure(&Algorithm::MSSIMSimple, a, b)
        .map_err(|e| match e {
            CompareError::DimensionsDiffer => {
                SsimError::DimensionMismatch(a.dimensions(), b.dimensions())
            }
            CompareError::CalculationFailed(message) => SsimError::Calculation(message),
        })?;

    Ok(SsimComparison {
        score: similarity.score,
        map: similarity.image.to_color_map().into_luma8(),
    })
}

/// Mean SSIM of two equally sized patches.
pub fn structural_similarity(a: &GrayImage, b: &GrayImage) -> Result<f64, SsimError> {
    compare(a, b).map(|c| c.score)
}

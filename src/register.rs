use image::{GrayImage, Luma};
use imageproc::geometric_transformations::{warp_into, Interpolation};
use imageproc::point::Point;
use log::debug;
use logging_timer::time;
use thiserror::Error;

use crate::features::{detect_and_compute, Features, OrbParams};
use crate::homography::{
    fit_homography_ransac, Homography, HomographyError, RansacParams, MIN_CORRESPONDENCES,
};
use crate::matching::{filter_matches, match_descriptors, MatchFilter};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AlignmentError {
    #[error(
        "insufficient or degenerate correspondences: {candidate} candidate and {reference} reference features"
    )]
    InsufficientFeatures { candidate: usize, reference: usize },
    #[error("insufficient or degenerate correspondences: {0} matches kept after filtering")]
    InsufficientMatches(usize),
    #[error("insufficient or degenerate correspondences: {0}")]
    Homography(#[from] HomographyError),
    #[error("insufficient or degenerate correspondences: estimated transform cannot be applied")]
    NonInvertible,
}

#[derive(Debug, Clone, Default)]
pub struct RegistrationOptions {
    pub orb: OrbParams,
    pub match_filter: MatchFilter,
    pub ransac: RansacParams,
}

/// A candidate warped into the reference frame.
#[derive(Debug, Clone)]
pub struct Registration {
    /// Same dimensions as the reference.
    pub image: GrayImage,
    /// Maps candidate coordinates to reference coordinates.
    pub transform: Homography,
    pub n_matches: usize,
    pub n_inliers: usize,
}

/// Aligns candidate scans to one reference form. The reference features are
/// computed once up front and reused for every candidate.
#[derive(Debug)]
pub struct Registrar {
    reference: GrayImage,
    reference_features: Features,
    options: RegistrationOptions,
}

impl Registrar {
    pub fn new(reference: GrayImage, options: RegistrationOptions) -> Self {
        let reference_features = detect_and_compute(&reference, &options.orb);
        debug!(
            "reference form: {} keypoints",
            reference_features.keypoints.len()
        );
        Self {
            reference,
            reference_features,
            options,
        }
    }

    #[time]
    pub fn register(&self, candidate: &GrayImage) -> Result<Registration, AlignmentError> {
        let candidate_features = detect_and_compute(candidate, &self.options.orb);
        if candidate_features.len() < MIN_CORRESPONDENCES
            || self.reference_features.len() < MIN_CORRESPONDENCES
        {
            return Err(AlignmentError::InsufficientFeatures {
                candidate: candidate_features.len(),
                reference: self.reference_features.len(),
            });
        }

        let matches = filter_matches(
            match_descriptors(
                &candidate_features.descriptors,
                &self.reference_features.descriptors,
            ),
            self.options.match_filter,
        );
        debug!(
            "{} candidate keypoints, {} matches kept",
            candidate_features.len(),
            matches.len()
        );
        if matches.len() < MIN_CORRESPONDENCES {
            return Err(AlignmentError::InsufficientMatches(matches.len()));
        }

        let (src, dst): (Vec<Point<f64>>, Vec<Point<f64>>) = matches
            .iter()
            .map(|m| {
                let c = &candidate_features.keypoints[m.query];
                let r = &self.reference_features.keypoints[m.train];
                (
                    Point::new(c.x as f64, c.y as f64),
                    Point::new(r.x as f64, r.y as f64),
                )
            })
            .unzip();

        let fit = fit_homography_ransac(&src, &dst, &self.options.ransac)?;
        let inlier_distances: Vec<u32> = matches
            .iter()
            .zip(&fit.inlier_mask)
            .filter(|(_, &inlier)| inlier)
            .map(|(m, _)| m.distance)
            .collect();
        debug!(
            "homography: {} of {} inliers after {} iterations, mean error {:.3}px, mean descriptor distance {:.1}",
            fit.n_inliers,
            matches.len(),
            fit.iterations,
            fit.mean_inlier_error,
            inlier_distances.iter().sum::<u32>() as f64 / inlier_distances.len().max(1) as f64
        );

        let projection = fit
            .homography
            .to_projection()
            .ok_or(AlignmentError::NonInvertible)?;

        let mut image = GrayImage::new(self.reference.width(), self.reference.height());
        warp_into(
            candidate,
            &projection,
            Interpolation::Bilinear,
            Luma([0]),
            &mut image,
        );

        Ok(Registration {
            image,
            transform: fit.homography,
            n_matches: matches.len(),
            n_inliers: fit.n_inliers,
        })
    }
}

#[cfg(test)]
mod tests {
    use imageproc::geometric_transformations::{warp, Projection};

    use super::*;
    use crate::regions::build_reference_regions;
    use crate::score::score_questionnaire;
    use crate::template::{QuestionId, QuestionLayouts};
    use crate::test_support::{draw_answer_boxes, layout, mark_option, synthetic_form};

    const CHECK_POINTS: [(f32, f32); 4] =
        [(60.0, 50.0), (340.0, 60.0), (80.0, 250.0), (320.0, 240.0)];

    /// Checks that reference points sent to the candidate by `skew` come
    /// back within `tolerance` pixels through the estimated transform.
    fn assert_recovers(skew: &Projection, registration: &Registration, tolerance: f64) {
        for &(x, y) in &CHECK_POINTS {
            let (cx, cy) = *skew * (x, y);
            let back = registration
                .transform
                .project(&Point::new(cx as f64, cy as f64))
                .unwrap();
            assert!(
                (back.x - x as f64).abs() < tolerance && (back.y - y as f64).abs() < tolerance,
                "({}, {}) came back as {:?}",
                x,
                y,
                back
            );
        }
    }

    fn shift_brightness(img: &GrayImage, delta: i16) -> GrayImage {
        GrayImage::from_fn(img.width(), img.height(), |x, y| {
            Luma([(img.get_pixel(x, y)[0] as i16 + delta).clamp(0, 255) as u8])
        })
    }

    fn perspective() -> Projection {
        Projection::from_matrix([1.0, 0.0, 6.0, 0.0, 1.0, -4.0, 6e-5, -4e-5, 1.0]).unwrap()
    }

    fn rotation_about_center(degrees: f32) -> Projection {
        Projection::translate(200.0, 150.0)
            * Projection::rotate(degrees.to_radians())
            * Projection::translate(-200.0, -150.0)
    }

    fn interior_difference(a: &GrayImage, b: &GrayImage, margin: u32) -> f64 {
        let (w, h) = a.dimensions();
        let mut total = 0.0;
        let mut count = 0.0;
        for y in margin..h - margin {
            for x in margin..w - margin {
                total += (a.get_pixel(x, y)[0] as f64 - b.get_pixel(x, y)[0] as f64).abs();
                count += 1.0;
            }
        }
        total / count
    }

    #[test]
    fn registering_reference_to_itself_is_near_identity() {
        let reference = synthetic_form(400, 300, 21);
        let registrar = Registrar::new(reference.clone(), RegistrationOptions::default());
        let registration = registrar.register(&reference).unwrap();

        assert_eq!(registration.image.dimensions(), reference.dimensions());
        for &(x, y) in &[(0.0, 0.0), (399.0, 0.0), (0.0, 299.0), (200.0, 150.0)] {
            let p = registration
                .transform
                .project(&Point::new(x, y))
                .unwrap();
            assert!((p.x - x).abs() < 0.5 && (p.y - y).abs() < 0.5, "{:?}", p);
        }
        assert!(interior_difference(&registration.image, &reference, 2) < 1.0);
    }

    #[test]
    fn recovers_rotated_and_shifted_copy() {
        let reference = synthetic_form(400, 300, 5);
        let angle = 4f32.to_radians();
        let skew = Projection::translate(12.0, -7.0)
            * Projection::translate(200.0, 150.0)
            * Projection::rotate(angle)
            * Projection::translate(-200.0, -150.0);
        let candidate = warp(&reference, &skew, Interpolation::Bilinear, Luma([235]));

        let registrar = Registrar::new(reference.clone(), RegistrationOptions::default());
        let registration = registrar.register(&candidate).unwrap();

        assert_recovers(&skew, &registration, 2.0);
        assert!(interior_difference(&registration.image, &reference, 40) < 12.0);
    }

    #[test]
    fn recovers_perspective_warp_under_brighter_lighting() {
        let reference = synthetic_form(400, 300, 5);
        let skew = perspective();
        let candidate = shift_brightness(
            &warp(&reference, &skew, Interpolation::Bilinear, Luma([235])),
            20,
        );

        let registrar = Registrar::new(reference, RegistrationOptions::default());
        let registration = registrar.register(&candidate).unwrap();
        assert_recovers(&skew, &registration, 2.5);
    }

    #[test]
    fn recovers_larger_rotation() {
        let reference = synthetic_form(400, 300, 8);
        let skew = rotation_about_center(8.0);
        let candidate = warp(&reference, &skew, Interpolation::Bilinear, Luma([235]));

        let registrar = Registrar::new(reference, RegistrationOptions::default());
        let registration = registrar.register(&candidate).unwrap();
        assert_recovers(&skew, &registration, 2.5);
    }

    #[test]
    fn recovers_upscaled_copy_into_reference_size() {
        let reference = synthetic_form(400, 300, 5);
        let skew = Projection::scale(1.5, 1.5);
        let mut candidate = GrayImage::from_pixel(600, 450, Luma([235]));
        warp_into(
            &reference,
            &skew,
            Interpolation::Bilinear,
            Luma([235]),
            &mut candidate,
        );

        let registrar = Registrar::new(reference.clone(), RegistrationOptions::default());
        let registration = registrar.register(&candidate).unwrap();
        assert_eq!(registration.image.dimensions(), reference.dimensions());
        assert_recovers(&skew, &registration, 2.5);
    }

    #[test]
    fn marked_answer_survives_perspective_and_darker_lighting() {
        let question = layout(100, 120, 180, 50, &["Yes", "No", "Maybe"]);
        let mut reference = synthetic_form(400, 300, 13);
        draw_answer_boxes(&mut reference, &question);
        let regions = build_reference_regions(
            &reference,
            &QuestionLayouts::new(vec![(QuestionId::from("Q1".to_string()), question)]),
        )
        .unwrap();

        let mut marked = reference.clone();
        mark_option(&mut marked, &regions.questions()[0].options[1].bounds);
        let candidate = shift_brightness(
            &warp(&marked, &perspective(), Interpolation::Bilinear, Luma([235])),
            -25,
        );

        let registrar = Registrar::new(reference, RegistrationOptions::default());
        let registration = registrar.register(&candidate).unwrap();
        let scores = score_questionnaire(&registration.image, &regions).unwrap();
        assert_eq!(scores[0].selected, 1);
    }

    #[test]
    fn blank_candidate_fails_to_align() {
        let reference = synthetic_form(300, 200, 9);
        let registrar = Registrar::new(reference, RegistrationOptions::default());
        let blank = GrayImage::from_pixel(300, 200, Luma([255]));
        let err = registrar.register(&blank).unwrap_err();
        assert!(matches!(err, AlignmentError::InsufficientFeatures { candidate: 0, .. }));
        assert!(err
            .to_string()
            .contains("insufficient or degenerate correspondences"));
    }
}

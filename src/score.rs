use image::GrayImage;
use logging_timer::time;
use thiserror::Error;

use crate::regions::{QuestionRegions, ReferenceRegions};
use crate::ssim::{self, SsimError};
use crate::template::QuestionId;
use crate::types::Size;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ScoringError {
    #[error(
        "question {question} option {option} region ({x1}, {y1})-({x2}, {y2}) exceeds the {width}x{height} registered image"
    )]
    RegionOutOfBounds {
        question: QuestionId,
        option: usize,
        x1: u32,
        y1: u32,
        x2: u32,
        y2: u32,
        width: u32,
        height: u32,
    },
    #[error("question {0} has no options")]
    NoOptions(QuestionId),
    #[error("question {question} option {option}: {source}")]
    Similarity {
        question: QuestionId,
        option: usize,
        source: SsimError,
    },
}

/// Similarity of every option of one question, and the option judged
/// marked.
#[derive(Debug, Clone, PartialEq)]
pub struct QuestionScore {
    pub question: QuestionId,
    /// SSIM per option against the unmarked reference, in option order.
    pub scores: Vec<f64>,
    pub selected: usize,
}

/// Index of the lowest score. The first of several equal minima wins.
pub fn select_option(scores: &[f64]) -> Option<usize> {
    scores
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (i, &score)| match best {
            Some((_, best_score)) if best_score <= score => best,
            _ => Some((i, score)),
        })
        .map(|(i, _)| i)
}

/// Crops every option of `question` out of `registered`, in option order.
pub fn candidate_crops(
    registered: &GrayImage,
    question: &QuestionRegions,
) -> Result<Vec<GrayImage>, ScoringError> {
    let size = Size {
        width: registered.width(),
        height: registered.height(),
    };
    question
        .options
        .iter()
        .map(|region| {
            let b = region.bounds;
            if !b.fits_within(size) {
                return Err(ScoringError::RegionOutOfBounds {
                    question: question.id.clone(),
                    option: region.option,
                    x1: b.x1,
                    y1: b.y1,
                    x2: b.x2,
                    y2: b.y2,
                    width: size.width,
                    height: size.height,
                });
            }
            Ok(b.crop(registered))
        })
        .collect()
}

pub fn score_question(
    registered: &GrayImage,
    question: &QuestionRegions,
) -> Result<QuestionScore, ScoringError> {
    if question.options.is_empty() {
        return Err(ScoringError::NoOptions(question.id.clone()));
    }

    let crops = candidate_crops(registered, question)?;
    let scores = question
        .options
        .iter()
        .zip(crops.iter())
        .map(|(region, crop)| {
            ssim::structural_similarity(crop, &region.reference).map_err(|source| {
                ScoringError::Similarity {
                    question: question.id.clone(),
                    option: region.option,
                    source,
                }
            })
        })
        .collect::<Result<Vec<f64>, ScoringError>>()?;

    let selected =
        select_option(&scores).ok_or_else(|| ScoringError::NoOptions(question.id.clone()))?;

    Ok(QuestionScore {
        question: question.id.clone(),
        scores,
        selected,
    })
}

#[time]
/// Scores every question of a registered image in declared order.
pub fn score_questionnaire(
    registered: &GrayImage,
    regions: &ReferenceRegions,
) -> Result<Vec<QuestionScore>, ScoringError> {
    regions
        .questions()
        .iter()
        .map(|question| score_question(registered, question))
        .collect()
}

#[cfg(test)]
mod tests {
    use image::Luma;

    use super::*;
    use crate::regions::{build_reference_regions, option_bounds};
    use crate::template::QuestionLayouts;
    use crate::test_support::{draw_answer_boxes, layout, mark_option};

    fn one_question_form() -> (GrayImage, ReferenceRegions) {
        let question = layout(20, 30, 150, 40, &["Yes", "No", "Maybe"]);
        let mut reference = GrayImage::from_pixel(200, 100, Luma([235]));
        draw_answer_boxes(&mut reference, &question);
        let regions = build_reference_regions(
            &reference,
            &QuestionLayouts::new(vec![(QuestionId::from("Q1".to_string()), question)]),
        )
        .unwrap();
        (reference, regions)
    }

    #[test]
    fn selects_lowest_score_with_first_index_on_ties() {
        assert_eq!(select_option(&[0.9, 0.2, 0.8]), Some(1));
        assert_eq!(select_option(&[0.5, 0.2, 0.2]), Some(1));
        assert_eq!(select_option(&[1.0, 1.0, 1.0]), Some(0));
        assert_eq!(select_option(&[-0.3]), Some(0));
        assert_eq!(select_option(&[]), None);
    }

    #[test]
    fn marked_option_is_selected() {
        let (reference, regions) = one_question_form();
        let question = &regions.questions()[0];
        let mut candidate = reference.clone();
        mark_option(&mut candidate, &question.options[1].bounds);

        let score = score_question(&candidate, question).unwrap();
        assert_eq!(score.selected, 1);
        assert_eq!(score.scores[0], 1.0);
        assert_eq!(score.scores[2], 1.0);
        assert!(score.scores[1] < score.scores[0]);
        assert!(score.scores[1] < score.scores[2]);
    }

    #[test]
    fn reference_identical_content_scores_one_and_is_not_selected() {
        let (reference, regions) = one_question_form();
        let question = &regions.questions()[0];

        let unmarked = score_question(&reference, question).unwrap();
        assert!(unmarked.scores.iter().all(|&s| s == 1.0));
        assert_eq!(unmarked.selected, 0);

        let mut candidate = reference.clone();
        mark_option(&mut candidate, &question.options[2].bounds);
        let marked = score_question(&candidate, question).unwrap();
        assert_eq!(marked.selected, 2);
        assert_eq!(marked.scores[0], 1.0);
        assert_eq!(marked.scores[1], 1.0);
    }

    #[test]
    fn scoring_is_deterministic() {
        let (reference, regions) = one_question_form();
        let mut candidate = reference.clone();
        mark_option(&mut candidate, &regions.questions()[0].options[0].bounds);

        let first = score_questionnaire(&candidate, &regions).unwrap();
        for _ in 0..3 {
            assert_eq!(score_questionnaire(&candidate, &regions).unwrap(), first);
        }
    }

    #[test]
    fn region_beyond_registered_image_is_an_error() {
        let (_, regions) = one_question_form();
        let small = GrayImage::from_pixel(100, 100, Luma([235]));
        assert!(matches!(
            score_questionnaire(&small, &regions),
            Err(ScoringError::RegionOutOfBounds { option: 1, .. })
        ));
    }

    #[test]
    fn question_without_options_is_an_error() {
        let (reference, regions) = one_question_form();
        let mut question = regions.questions()[0].clone();
        question.options.clear();
        assert_eq!(
            score_question(&reference, &question),
            Err(ScoringError::NoOptions(QuestionId::from("Q1".to_string())))
        );
    }

    #[test]
    fn candidate_crops_follow_option_bounds() {
        let (reference, regions) = one_question_form();
        let question = &regions.questions()[0];
        let crops = candidate_crops(&reference, question).unwrap();
        let expected: Vec<(u32, u32)> = option_bounds(&question.layout)
            .iter()
            .map(|b| (b.width(), b.height()))
            .collect();
        let actual: Vec<(u32, u32)> = crops.iter().map(GrayImage::dimensions).collect();
        assert_eq!(actual, expected);
    }
}

use std::fs;
use std::path::{Path, PathBuf};

use image::{GrayImage, Rgb, RgbImage};
use imageproc::{
    drawing::{
        draw_filled_rect_mut, draw_hollow_rect_mut, draw_line_segment_mut, draw_text_mut,
        text_size,
    },
    rect::Rect,
};
use log::{debug, warn};
use rusttype::{Font, Scale};

use crate::{
    geometry::center_of_rect,
    image_utils::{diff, gray_to_rgb, tile_grid, BLUE, GREEN, RED, WHITE_RGB},
    regions::{QuestionRegions, ReferenceRegions},
    score::{candidate_crops, QuestionScore},
    ssim,
};

const GRID_GAP: u32 = 4;
const LABEL_SCALE: f32 = 14.0;
/// Height of the band above the comparison grid holding the scores.
const SCORE_HEADER: u32 = 18;

/// Creates a path for a debug image.
pub fn debug_image_path(dir: &Path, id: &str, label: &str) -> PathBuf {
    dir.join(format!("{}_{}.png", id, label))
}

fn save_or_warn(image: &RgbImage, path: &Path) {
    match image.save(path) {
        Ok(()) => debug!("wrote {}", path.display()),
        Err(e) => warn!("unable to write {}: {}", path.display(), e),
    }
}

fn monospace_font() -> Option<Font<'static>> {
    Font::try_from_bytes(include_bytes!("../fonts/DejaVuSansMono.ttf"))
}

fn draw_text_with_background_mut(
    canvas: &mut RgbImage,
    text: &str,
    x: i32,
    y: i32,
    font: &Font,
    text_color: Rgb<u8>,
    background_color: Rgb<u8>,
) {
    let scale = Scale::uniform(LABEL_SCALE);
    let (text_width, text_height) = text_size(scale, font, text);
    if text_width <= 0 || text_height <= 0 {
        return;
    }

    draw_filled_rect_mut(
        canvas,
        Rect::at(x, y).of_size(text_width as u32, text_height as u32),
        background_color,
    );
    draw_text_mut(canvas, text_color, x, y, scale, font, text);
}

/// Saves every reference option crop as `<question>_<option>_labeled.png`
/// in `dir`. Returns the number of crops written.
pub fn write_reference_crops(dir: &Path, regions: &ReferenceRegions) -> usize {
    if let Err(e) = fs::create_dir_all(dir) {
        warn!("unable to create {}: {}", dir.display(), e);
        return 0;
    }

    let mut written = 0;
    for question in regions.questions() {
        for region in &question.options {
            let path = dir.join(format!("{}_{}_labeled.png", question.id, region.option));
            match region.reference.save(&path) {
                Ok(()) => written += 1,
                Err(e) => warn!("unable to write {}: {}", path.display(), e),
            }
        }
    }
    written
}

/// Outlines every question in red and every option in green, labels them
/// with the question id and option index, and crosses out the selected
/// option in blue.
pub fn draw_scored_questions_debug_image_mut(
    canvas: &mut RgbImage,
    regions: &ReferenceRegions,
    scores: &[QuestionScore],
) {
    let font = monospace_font();

    for (question, score) in regions.questions().iter().zip(scores) {
        let question_rect = question.bounds().to_rect();

        if let Some(font) = &font {
            let (_, text_height) =
                text_size(Scale::uniform(LABEL_SCALE), font, question.id.as_str());
            draw_text_with_background_mut(
                canvas,
                question.id.as_str(),
                question_rect.left(),
                question_rect.top() - text_height - 2,
                font,
                RED,
                WHITE_RGB,
            );
            for region in &question.options {
                draw_text_with_background_mut(
                    canvas,
                    &region.option.to_string(),
                    region.bounds.x1 as i32 + 3,
                    region.bounds.y1 as i32 + 3,
                    font,
                    GREEN,
                    WHITE_RGB,
                );
            }
        }

        for region in &question.options {
            draw_hollow_rect_mut(canvas, region.bounds.to_rect(), GREEN);
        }
        draw_hollow_rect_mut(canvas, question_rect, RED);

        if let Some(selected) = question.options.get(score.selected) {
            let rect = selected.bounds.to_rect();
            let center = center_of_rect(&rect);
            let half_w = rect.width() as f32 / 2.0;
            let half_h = rect.height() as f32 / 2.0;
            draw_line_segment_mut(
                canvas,
                (center.x - half_w, center.y - half_h),
                (center.x + half_w, center.y + half_h),
                BLUE,
            );
            draw_line_segment_mut(
                canvas,
                (center.x - half_w, center.y + half_h),
                (center.x + half_w, center.y - half_h),
                BLUE,
            );
        }
    }
}

/// Side-by-side comparison of one question: reference crops, candidate
/// crops, their difference and the SSIM map, one row each, under a band
/// with each option's score. The selected option's score is red.
pub fn question_comparison_debug_image(
    registered: &GrayImage,
    question: &QuestionRegions,
    score: &QuestionScore,
) -> Option<RgbImage> {
    let crops = candidate_crops(registered, question).ok()?;

    let references: Vec<GrayImage> = question
        .options
        .iter()
        .map(|r| r.reference.clone())
        .collect();
    let diffs: Vec<GrayImage> = references
        .iter()
        .zip(&crops)
        .map(|(reference, crop)| diff(reference, crop))
        .collect();
    let maps: Vec<GrayImage> = references
        .iter()
        .zip(&crops)
        .map(|(reference, crop)| ssim::compare(crop, reference).map(|c| c.map))
        .collect::<Result<_, _>>()
        .ok()?;

    let cell = (
        references.iter().map(GrayImage::width).max()?,
        references.iter().map(GrayImage::height).max()?,
    );
    let mut canvas = tile_grid(&[references, crops, diffs, maps], cell, GRID_GAP, SCORE_HEADER);

    if let Some(font) = monospace_font() {
        for (column, value) in score.scores.iter().enumerate() {
            let color = if column == score.selected { RED } else { GREEN };
            draw_text_with_background_mut(
                &mut canvas,
                &format!("{:.4}", value),
                (GRID_GAP + column as u32 * (cell.0 + GRID_GAP)) as i32,
                2,
                &font,
                color,
                WHITE_RGB,
            );
        }
    }

    Some(canvas)
}

/// Writes the optional per-questionnaire images: an annotated preview of the
/// registered scan, and in detail mode one comparison image per question.
/// Failing to write any of them is logged and otherwise ignored.
#[derive(Debug, Clone, Default)]
pub struct QuestionnaireDebugWriter {
    preview_dir: Option<PathBuf>,
    detail_dir: Option<PathBuf>,
}

impl QuestionnaireDebugWriter {
    pub fn new(preview_dir: Option<PathBuf>, detail_dir: Option<PathBuf>) -> Self {
        for dir in preview_dir.iter().chain(detail_dir.iter()) {
            if let Err(e) = fs::create_dir_all(dir) {
                warn!("unable to create {}: {}", dir.display(), e);
            }
        }
        Self {
            preview_dir,
            detail_dir,
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    /// `id` names the files: `<id>_labeled.png` for the preview and
    /// `<id>_<question>_labeled.png` for each comparison.
    pub fn write(
        &self,
        id: &str,
        registered: &GrayImage,
        regions: &ReferenceRegions,
        scores: &[QuestionScore],
    ) {
        if let Some(dir) = &self.detail_dir {
            for (question, score) in regions.questions().iter().zip(scores) {
                debug!(
                    "{} {}: {}",
                    id,
                    question.id,
                    score
                        .scores
                        .iter()
                        .enumerate()
                        .map(|(i, s)| {
                            format!("{}={:.4}", question.layout.label(i).unwrap_or("?"), s)
                        })
                        .collect::<Vec<_>>()
                        .join(" ")
                );
                match question_comparison_debug_image(registered, question, score) {
                    Some(image) => save_or_warn(
                        &image,
                        &debug_image_path(dir, id, &format!("{}_labeled", question.id)),
                    ),
                    None => warn!("{}: unable to render comparison for {}", id, question.id),
                }
            }
        }

        if let Some(dir) = &self.preview_dir {
            let mut canvas = gray_to_rgb(registered);
            draw_scored_questions_debug_image_mut(&mut canvas, regions, scores);
            save_or_warn(&canvas, &debug_image_path(dir, id, "labeled"));
        }
    }
}

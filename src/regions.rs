use image::{imageops, GrayImage};
use imageproc::rect::Rect;
use logging_timer::time;

use crate::template::{ConfigurationError, QuestionId, QuestionLayout, QuestionLayouts};
use crate::types::Size;

/// Pixel bounds of an option box in reference coordinates. `x2`/`y2` are
/// exclusive.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct RegionBounds {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl RegionBounds {
    pub fn width(&self) -> u32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> u32 {
        self.y2 - self.y1
    }

    /// Whether these bounds lie entirely within an image of the given size.
    pub fn fits_within(&self, size: Size<u32>) -> bool {
        self.x1 < self.x2 && self.y1 < self.y2 && self.x2 <= size.width && self.y2 <= size.height
    }

    pub fn to_rect(&self) -> Rect {
        Rect::at(self.x1 as i32, self.y1 as i32).of_size(self.width(), self.height())
    }

    /// Copies the pixels inside these bounds out of `img`.
    pub fn crop(&self, img: &GrayImage) -> GrayImage {
        imageops::crop_imm(img, self.x1, self.y1, self.width(), self.height()).to_image()
    }
}

/// One option box of a question together with what it looks like on the
/// unmarked reference form.
#[derive(Debug, Clone)]
pub struct ReferenceRegion {
    pub option: usize,
    pub bounds: RegionBounds,
    pub reference: GrayImage,
}

#[derive(Debug, Clone)]
pub struct QuestionRegions {
    pub id: QuestionId,
    pub layout: QuestionLayout,
    pub options: Vec<ReferenceRegion>,
}

impl QuestionRegions {
    /// Bounds of the whole question, i.e. the union of its option boxes.
    pub fn bounds(&self) -> RegionBounds {
        RegionBounds {
            x1: self.layout.xy.x,
            y1: self.layout.xy.y,
            x2: self.layout.xy.x + self.layout.size.width,
            y2: self.layout.xy.y + self.layout.size.height,
        }
    }
}

/// All reference regions of a template, in declared question order. Built
/// once per run and only read afterwards.
#[derive(Debug, Clone)]
pub struct ReferenceRegions {
    questions: Vec<QuestionRegions>,
}

impl ReferenceRegions {
    pub fn questions(&self) -> &[QuestionRegions] {
        &self.questions
    }

    pub fn question_ids(&self) -> impl Iterator<Item = &QuestionId> {
        self.questions.iter().map(|q| &q.id)
    }

    pub fn len(&self) -> usize {
        self.questions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }
}

/// Splits a question's bounding box into `choice_count` adjacent boxes. All
/// boxes but the last are `box_width` wide; the last one ends at the right
/// edge of the bounding box so the boxes always tile it exactly.
pub fn option_bounds(layout: &QuestionLayout) -> Vec<RegionBounds> {
    let box_width = layout.box_width();
    let y1 = layout.xy.y;
    let y2 = layout.xy.y + layout.size.height;
    let right = layout.xy.x + layout.size.width;

    (0..layout.choice_count)
        .map(|i| {
            let x1 = layout.xy.x + i * box_width;
            let x2 = if i + 1 == layout.choice_count {
                right
            } else {
                layout.xy.x + (i + 1) * box_width
            };
            RegionBounds { x1, y1, x2, y2 }
        })
        .collect()
}

#[time]
/// Cuts every option box of every question out of the reference image.
pub fn build_reference_regions(
    reference: &GrayImage,
    questions: &QuestionLayouts,
) -> Result<ReferenceRegions, ConfigurationError> {
    if questions.is_empty() {
        return Err(ConfigurationError::NoQuestions);
    }

    let image_size = Size {
        width: reference.width(),
        height: reference.height(),
    };

    let questions = questions
        .iter()
        .map(|(id, layout)| {
            layout.validate(id, image_size)?;
            let options = option_bounds(layout)
                .into_iter()
                .enumerate()
                .map(|(option, bounds)| ReferenceRegion {
                    option,
                    bounds,
                    reference: bounds.crop(reference),
                })
                .collect();
            Ok(QuestionRegions {
                id: id.clone(),
                layout: layout.clone(),
                options,
            })
        })
        .collect::<Result<Vec<_>, ConfigurationError>>()?;

    Ok(ReferenceRegions { questions })
}

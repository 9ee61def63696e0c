//! Synthetic forms for tests.

use image::{GrayImage, Luma};
use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;
use rand::prelude::*;

use crate::regions::{option_bounds, RegionBounds};
use crate::template::QuestionLayout;
use crate::types::{Point, Size};

/// A light page covered with randomly placed dark blocks, which gives the
/// feature detector plenty of distinctive corners.
pub fn synthetic_form(width: u32, height: u32, seed: u64) -> GrayImage {
    let mut img = GrayImage::from_pixel(width, height, Luma([235]));
    let mut rng = StdRng::seed_from_u64(seed);
    let count = (width * height / 2000).max(20);
    for _ in 0..count {
        let w = rng.gen_range(6..32);
        let h = rng.gen_range(6..32);
        let x = rng.gen_range(0..width.saturating_sub(w).max(1)) as i32;
        let y = rng.gen_range(0..height.saturating_sub(h).max(1)) as i32;
        let shade = rng.gen_range(0..180u8);
        draw_filled_rect_mut(&mut img, Rect::at(x, y).of_size(w, h), Luma([shade]));
    }
    img
}

pub fn layout(x: u32, y: u32, width: u32, height: u32, labels: &[&str]) -> QuestionLayout {
    QuestionLayout {
        xy: Point { x, y },
        size: Size { width, height },
        choice_count: labels.len() as u32,
        labels: labels.iter().map(|l| l.to_string()).collect(),
    }
}

/// Clears the question area and draws an empty outlined box per option.
pub fn draw_answer_boxes(img: &mut GrayImage, layout: &QuestionLayout) {
    draw_filled_rect_mut(
        img,
        Rect::at(layout.xy.x as i32, layout.xy.y as i32)
            .of_size(layout.size.width, layout.size.height),
        Luma([250]),
    );
    for bounds in option_bounds(layout) {
        let inset = Rect::at(bounds.x1 as i32 + 2, bounds.y1 as i32 + 2)
            .of_size(bounds.width() - 4, bounds.height() - 4);
        draw_hollow_rect_mut(img, inset, Luma([20]));
    }
}

/// Fills a dark bubble in the middle of an option box.
pub fn mark_option(img: &mut GrayImage, bounds: &RegionBounds) {
    let center = (
        (bounds.x1 + bounds.width() / 2) as i32,
        (bounds.y1 + bounds.height() / 2) as i32,
    );
    let radius = (bounds.width().min(bounds.height()) / 3) as i32;
    draw_filled_circle_mut(img, center, radius, Luma([10]));
}

use image::{imageops, DynamicImage, GrayImage, Luma, Rgb, RgbImage};

pub const WHITE_RGB: Rgb<u8> = Rgb([255, 255, 255]);
pub const RED: Rgb<u8> = Rgb([255, 0, 0]);
pub const GREEN: Rgb<u8> = Rgb([0, 200, 0]);
pub const BLUE: Rgb<u8> = Rgb([0, 0, 255]);

/// Generates an image from two images where corresponding pixels in `compare`
/// that are darker than their counterpart in `base` show up with the luminosity
/// difference between the two. This is useful for determining where a
/// light-background form was filled out, for example.
///
/// Note that the sizes of the images must be equal.
///
/// ```text
///         BASE                  COMPARE                 DIFF
/// ┌───────────────────┐  ┌───────────────────┐  ┌───────────────────┐
/// │                   │  │        █ █ ███    │  │        █ █ ███    │
/// │ █ █               │  │ █ █    ███  █     │  │        ███  █     │
/// │  █                │  │  █     █ █ ███    │  │        █ █ ███    │
/// │ █ █ █████████████ │  │ █ █ █████████████ │  │                   │
/// └───────────────────┘  └───────────────────┘  └───────────────────┘
/// ```
///
pub fn diff(base: &GrayImage, compare: &GrayImage) -> GrayImage {
    assert_eq!(base.dimensions(), compare.dimensions());

    let mut out = GrayImage::new(base.width(), base.height());

    base.enumerate_pixels().for_each(|(x, y, base_pixel)| {
        let compare_pixel = compare.get_pixel(x, y);
        let diff = base_pixel.0[0].saturating_sub(compare_pixel.0[0]);
        out.put_pixel(x, y, Luma([u8::MAX - diff]));
    });

    out
}

pub fn gray_to_rgb(img: &GrayImage) -> RgbImage {
    DynamicImage::ImageLuma8(img.clone()).into_rgb8()
}

/// Lays out rows of tiles on a white canvas, each tile in a `cell` sized
/// slot separated by `gap` pixels. The top `header` pixels are left blank.
pub fn tile_grid(rows: &[Vec<GrayImage>], cell: (u32, u32), gap: u32, header: u32) -> RgbImage {
    let columns = rows.iter().map(Vec::len).max().unwrap_or(0) as u32;
    let width = gap + columns * (cell.0 + gap);
    let height = header + gap + rows.len() as u32 * (cell.1 + gap);
    let mut canvas = RgbImage::from_pixel(width, height, WHITE_RGB);

    for (r, row) in rows.iter().enumerate() {
        for (c, tile) in row.iter().enumerate() {
            let x = gap + c as u32 * (cell.0 + gap);
            let y = header + gap + r as u32 * (cell.1 + gap);
            imageops::replace(&mut canvas, &gray_to_rgb(tile), x as i64, y as i64);
        }
    }

    canvas
}

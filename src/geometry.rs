use imageproc::point::Point;
use imageproc::rect::Rect;

pub fn distance_from_point_to_point(p1: &Point<f64>, p2: &Point<f64>) -> f64 {
    ((p1.x - p2.x).powi(2) + (p1.y - p2.y).powi(2)).sqrt()
}

/// Area of the triangle spanned by three points.
pub fn triangle_area(a: &Point<f64>, b: &Point<f64>, c: &Point<f64>) -> f64 {
    ((b.x - a.x) * (c.y - a.y) - (c.x - a.x) * (b.y - a.y)).abs() / 2.0
}

/// Whether any three of the given points are (nearly) collinear. Collinear
/// triples make a point set useless for fitting a projective transform.
pub fn has_collinear_triple(points: &[Point<f64>], min_area: f64) -> bool {
    let n = points.len();
    for i in 0..n {
        for j in (i + 1)..n {
            for k in (j + 1)..n {
                if triangle_area(&points[i], &points[j], &points[k]) < min_area {
                    return true;
                }
            }
        }
    }
    false
}

pub fn center_of_rect(rect: &Rect) -> Point<f32> {
    Point::new(
        rect.left() as f32 + rect.width() as f32 / 2.0,
        rect.top() as f32 + rect.height() as f32 / 2.0,
    )
}

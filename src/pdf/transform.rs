//! Placement transforms for embedded pages
//!
//! PDF matrices `[a b c d e f]` map `x' = a*x + c*y + e`, `y' = b*x + d*y + f`.
//! We keep them as [`tiny_skia_path::Transform`], whose `from_row` takes the
//! same six values in the same order.

use tiny_skia_path::{Point, Rect, Transform};
use lopdf::Object;
use crate::error::{Error, Result};

/// Page rotation, as set by the page's `/Rotate` entry (clockwise)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    None,
    Quarter,
    Half,
    ThreeQuarter,
}

impl Rotation {
    /// Validate a raw `/Rotate` value
    ///
    /// Any multiple of 90 is accepted and normalised into 0..360, so `-90`
    /// is the same as `270`.
    pub fn from_degrees(page: u32, degrees: i64) -> Result<Self> {
        match degrees.rem_euclid(360) {
            0 => Ok(Rotation::None),
            90 => Ok(Rotation::Quarter),
            180 => Ok(Rotation::Half),
            270 => Ok(Rotation::ThreeQuarter),
            _ => Err(Error::UnsupportedRotation { page, rotation: degrees }),
        }
    }

    pub fn degrees(self) -> i64 {
        match self {
            Rotation::None => 0,
            Rotation::Quarter => 90,
            Rotation::Half => 180,
            Rotation::ThreeQuarter => 270,
        }
    }

    /// Whether width and height trade places once the rotation is applied
    pub fn swaps_axes(self) -> bool {
        matches!(self, Rotation::Quarter | Rotation::ThreeQuarter)
    }

    /// Matrix that turns a `width` x `height` box at the origin into its rotated
    /// appearance, again anchored at the origin
    pub fn correction(self, width: f32, height: f32) -> Transform {
        match self {
            Rotation::None => Transform::identity(),
            Rotation::Quarter => Transform::from_row(0.0, -1.0, 1.0, 0.0, 0.0, width),
            Rotation::Half => Transform::from_row(-1.0, 0.0, 0.0, -1.0, width, height),
            Rotation::ThreeQuarter => Transform::from_row(0.0, 1.0, -1.0, 0.0, height, 0.0),
        }
    }
}

/// Transform placing a page's view box, rotated, onto `target`
///
/// The rotation correction runs first (innermost), then the scale into the target
/// rectangle. With no target the rotated view box lands at the origin at scale 1.
pub fn placement(view_box: [f32; 4], rotation: Rotation, target: Option<Rect>) -> Transform {
    let width = view_box[2] - view_box[0];
    let height = view_box[3] - view_box[1];
    let (rotated_width, rotated_height) = if rotation.swaps_axes() {
        (height, width)
    } else {
        (width, height)
    };

    let (x, y, scale_x, scale_y) = match target {
        Some(rect) => (
            rect.x(),
            rect.y(),
            ratio(rect.width(), rotated_width),
            ratio(rect.height(), rotated_height),
        ),
        None => (0.0, 0.0, 1.0, 1.0),
    };

    Transform::from_translate(x, y)
        .pre_scale(scale_x, scale_y)
        .pre_concat(rotation.correction(width, height))
        .pre_translate(-view_box[0], -view_box[1])
}

fn ratio(target: f32, source: f32) -> f32 {
    if source.abs() < f32::EPSILON {
        1.0
    } else {
        target / source
    }
}

/// The six PDF matrix values `[a b c d e f]`
pub fn to_pdf_matrix(transform: &Transform) -> [f32; 6] {
    [
        transform.sx,
        transform.ky,
        transform.kx,
        transform.sy,
        transform.tx,
        transform.ty,
    ]
}

/// Matrix as a PDF array, for `/Matrix` entries
pub fn to_pdf_array(transform: &Transform) -> Object {
    Object::Array(
        to_pdf_matrix(transform)
            .iter()
            .map(|value| Object::Real(*value))
            .collect(),
    )
}

/// A `cm` operator line for this transform
pub fn cm_operator(transform: &Transform) -> String {
    let m = to_pdf_matrix(transform);
    format!("{} {} {} {} {} {} cm\n", m[0], m[1], m[2], m[3], m[4], m[5])
}

/// Bounding box `[llx lly urx ury]` of a rectangle after transformation
pub fn map_rect(transform: &Transform, rect: [f32; 4]) -> [f32; 4] {
    let mut corners = [
        Point::from_xy(rect[0], rect[1]),
        Point::from_xy(rect[2], rect[1]),
        Point::from_xy(rect[2], rect[3]),
        Point::from_xy(rect[0], rect[3]),
    ];
    transform.map_points(&mut corners);

    let mut bounds = [f32::MAX, f32::MAX, f32::MIN, f32::MIN];
    for corner in &corners {
        bounds[0] = bounds[0].min(corner.x);
        bounds[1] = bounds[1].min(corner.y);
        bounds[2] = bounds[2].max(corner.x);
        bounds[3] = bounds[3].max(corner.y);
    }
    bounds
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: [f32; 4], expected: [f32; 4]) {
        for (a, e) in actual.iter().zip(expected.iter()) {
            assert!((a - e).abs() < 0.001, "{:?} != {:?}", actual, expected);
        }
    }

    #[test]
    fn test_rotation_validation() {
        assert_eq!(Rotation::from_degrees(1, 0).unwrap(), Rotation::None);
        assert_eq!(Rotation::from_degrees(1, 90).unwrap(), Rotation::Quarter);
        assert_eq!(Rotation::from_degrees(1, 180).unwrap(), Rotation::Half);
        assert_eq!(Rotation::from_degrees(1, 270).unwrap(), Rotation::ThreeQuarter);
        assert_eq!(Rotation::from_degrees(1, -90).unwrap(), Rotation::ThreeQuarter);
        assert_eq!(Rotation::from_degrees(1, 450).unwrap(), Rotation::Quarter);

        let err = Rotation::from_degrees(3, 45).unwrap_err();
        assert!(matches!(err, Error::UnsupportedRotation { page: 3, rotation: 45 }));
    }

    #[test]
    fn test_known_rotation_matrices() {
        let w = 200.0;
        let h = 300.0;
        assert_eq!(to_pdf_matrix(&Rotation::None.correction(w, h)), [1.0, 0.0, 0.0, 1.0, 0.0, 0.0]);
        assert_eq!(to_pdf_matrix(&Rotation::Quarter.correction(w, h)), [0.0, -1.0, 1.0, 0.0, 0.0, 200.0]);
        assert_eq!(to_pdf_matrix(&Rotation::Half.correction(w, h)), [-1.0, 0.0, 0.0, -1.0, 200.0, 300.0]);
        assert_eq!(to_pdf_matrix(&Rotation::ThreeQuarter.correction(w, h)), [0.0, 1.0, -1.0, 0.0, 300.0, 0.0]);
    }

    #[test]
    fn test_placement_aligns_with_target_for_every_rotation() {
        let view_box = [20.0, 30.0, 220.0, 330.0];
        for degrees in [0, 90, 180, 270] {
            let rotation = Rotation::from_degrees(1, degrees).unwrap();
            let (width, height) = if rotation.swaps_axes() { (150.0, 100.0) } else { (100.0, 150.0) };
            let target = Rect::from_xywh(50.0, 60.0, width, height).unwrap();
            let transform = placement(view_box, rotation, Some(target));
            assert_close(map_rect(&transform, view_box), [50.0, 60.0, 50.0 + width, 60.0 + height]);
        }
    }

    #[test]
    fn test_quarter_turn_moves_top_left_to_top_right() {
        let view_box = [0.0, 0.0, 200.0, 300.0];
        let transform = placement(view_box, Rotation::Quarter, None);
        let mut top_left = [Point::from_xy(0.0, 300.0)];
        transform.map_points(&mut top_left);
        assert!((top_left[0].x - 300.0).abs() < 0.001);
        assert!((top_left[0].y - 200.0).abs() < 0.001);
    }

    #[test]
    fn test_cm_operator() {
        let transform = Transform::from_row(1.0, 0.0, 0.0, 1.0, 10.0, 20.5);
        assert_eq!(cm_operator(&transform), "1 0 0 1 10 20.5 cm\n");
    }
}

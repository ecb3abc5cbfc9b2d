//! Point and rectangle measurements against the current depth field.

use crate::calib::Calibration;
use crate::scene::SceneObject;
use crate::types::{DepthField, DisparityMap, Distance, Direction, Point2i, Point3f, Rect};

pub fn disparity_at(disp: &DisparityMap, x: u32, y: u32) -> u8 {
    disp.get(x, y).copied().unwrap_or(0)
}

pub fn distance_at(depth: &DepthField, x: u32, y: u32) -> Distance {
    Distance::from_raw(depth.get(x, y).copied().unwrap_or(0))
}

/// Median of the valid readings inside `rect`.
pub fn distance_to_rect(depth: &DepthField, rect: Rect) -> Distance {
    if rect.is_empty() {
        return Distance::NoReading;
    }
    let Some(region) = rect.region(depth.width(), depth.height()) else {
        return Distance::NoReading;
    };
    let mut values: Vec<u16> = Vec::new();
    for y in region.y0..region.y1 {
        values.extend(
            depth.row(y)[region.x0 as usize..region.x1 as usize]
                .iter()
                .copied()
                .filter(|&v| v != 0),
        );
    }
    if values.is_empty() {
        return Distance::NoReading;
    }
    let mid = values.len() / 2;
    let (_, median, _) = values.select_nth_unstable(mid);
    Distance::Millimetres(*median)
}

/// Camera-space point (mm) behind a pixel; `None` without a reading.
pub fn world_point_at(depth: &DepthField, cal: &Calibration, x: u32, y: u32) -> Option<Point3f> {
    let mm = distance_at(depth, x, y).mm()?;
    Some(cal.back_project(x as f32, y as f32, mm as f32))
}

/// Same as [`world_point_at`] in metres.
pub fn world_point_at_m(depth: &DepthField, cal: &Calibration, x: u32, y: u32) -> Option<Point3f> {
    world_point_at(depth, cal, x, y).map(Point3f::to_metres)
}

pub fn direction_to_point(cal: &Calibration, x: i32, y: i32) -> Direction {
    let p = cal.params();
    if x < 0 || y < 0 || x as u32 >= p.image_width || y as u32 >= p.image_height {
        return Direction::Undefined;
    }
    Direction::Degrees(cal.column_angle_deg(x as f32))
}

pub fn direction_to_rect(cal: &Calibration, rect: Rect) -> Direction {
    if rect.is_empty() {
        return Direction::Undefined;
    }
    let c = rect.centre();
    direction_to_point(cal, c.x, c.y)
}

/// Describe the entity occupying `rect` using the depth inside it.
pub fn locate(depth: &DepthField, cal: &Calibration, rect: Rect) -> SceneObject {
    let distance = distance_to_rect(depth, rect);
    let centre: Point2i = rect.centre();
    let centre_world = distance
        .mm()
        .map(|mm| cal.back_project(centre.x as f32, centre.y as f32, mm as f32));
    SceneObject {
        distance,
        angle: direction_to_rect(cal, rect),
        bounding_rect: rect,
        centre,
        centre_world,
    }
}

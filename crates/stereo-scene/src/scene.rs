//! Scene queries over a depth field: nearest reading, nearest obstacle,
//! open space and obstacle-avoidance heading.
//!
//! Every query takes a region of interest; an empty rectangle means the whole
//! frame and a rectangle entirely outside the frame yields the "no result"
//! value of the query rather than an error.

use crate::calib::Calibration;
use crate::types::{DepthField, DisparityMap, Distance, Direction, Point2i, Point3f, Rect};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BypassParams {
    /// Pixels nearer than this (mm) count as blocking.
    pub dist_threshold: u16,
    pub zone_count: usize,
    /// Minimum share of a zone's valid pixels that are blocking.
    pub occupancy_threshold: f32,
    /// Minimum share of all zone pixels that are blocking.
    pub point_ratio_threshold: f32,
}

impl Default for BypassParams {
    fn default() -> Self {
        Self {
            dist_threshold: 3000,
            zone_count: 10,
            occupancy_threshold: 0.1,
            point_ratio_threshold: 0.01,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Largest depth step (mm) between neighbouring pixels of one obstacle.
    pub obstacle_step_mm: u16,
    /// Obstacle pixels lie within this depth (mm) behind the nearest point.
    pub obstacle_band_mm: u16,
    /// Frames with a smaller share of valid pixels are dead zones.
    pub dead_zone_min_valid_ratio: f32,
    pub farthest_band_width: u32,
    pub bypass: BypassParams,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            obstacle_step_mm: 100,
            obstacle_band_mm: 500,
            dead_zone_min_valid_ratio: 0.1,
            farthest_band_width: 100,
            bypass: BypassParams::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScenePoint {
    pub image: Point2i,
    pub world: Point3f,
}

/// Fields shared by every detected entity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SceneObject {
    pub distance: Distance,
    pub angle: Direction,
    pub bounding_rect: Rect,
    pub centre: Point2i,
    pub centre_world: Option<Point3f>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Obstacle {
    pub object: SceneObject,
    pub min_world: Point3f,
    pub max_world: Point3f,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gender {
    Female,
    Male,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FaceInfo {
    pub face_rect: Rect,
    pub left_eye: Option<Point2i>,
    pub right_eye: Option<Point2i>,
}

/// Labels returned by the external biometrics service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Biometrics {
    pub gender: Option<Gender>,
    pub age: Option<u8>,
    pub face: Option<FaceInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Human {
    pub object: SceneObject,
    pub biometrics: Option<Biometrics>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SceneInfo {
    pub nearest_distance: Distance,
    /// Raw disparity at the nearest point; 0 when there is none.
    pub nearest_disp: u8,
    pub nearest_point: Option<ScenePoint>,
    pub nearest_obstacle: Option<Obstacle>,
}

impl Default for SceneInfo {
    fn default() -> Self {
        Self {
            nearest_distance: Distance::NoReading,
            nearest_disp: 0,
            nearest_point: None,
            nearest_obstacle: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SceneAnalyzer {
    config: AnalysisConfig,
}

impl SceneAnalyzer {
    pub fn new(config: AnalysisConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn nearest_distance(&self, depth: &DepthField, roi: Rect) -> Distance {
        match nearest_pixel(depth, roi) {
            Some((v, _, _)) => Distance::Millimetres(v),
            None => Distance::NoReading,
        }
    }

    /// First minimum in row-major order.
    pub fn nearest_point(&self, depth: &DepthField, cal: &Calibration, roi: Rect) -> Option<ScenePoint> {
        let (v, x, y) = nearest_pixel(depth, roi)?;
        Some(ScenePoint {
            image: Point2i::new(x as i32, y as i32),
            world: cal.back_project(x as f32, y as f32, v as f32),
        })
    }

    /// Grow a 4-connected region from the nearest pixel and report its extents.
    pub fn nearest_obstacle(&self, depth: &DepthField, cal: &Calibration, roi: Rect) -> Option<Obstacle> {
        let region = roi.region(depth.width(), depth.height())?;
        let (seed_v, sx, sy) = nearest_pixel(depth, roi)?;
        let limit = seed_v.saturating_add(self.config.obstacle_band_mm);
        let step = self.config.obstacle_step_mm;

        let rw = (region.x1 - region.x0) as usize;
        let mut visited = vec![false; region.area()];
        let local = |x: u32, y: u32| (y - region.y0) as usize * rw + (x - region.x0) as usize;

        let mut queue = VecDeque::new();
        visited[local(sx, sy)] = true;
        queue.push_back((sx, sy, seed_v));

        let (mut min_x, mut min_y, mut max_x, mut max_y) = (sx, sy, sx, sy);
        let mut lo = Point3f::new(f32::MAX, f32::MAX, f32::MAX);
        let mut hi = Point3f::new(f32::MIN, f32::MIN, f32::MIN);
        let mut sum = [0.0f64; 3];
        let mut count = 0usize;

        while let Some((x, y, v)) = queue.pop_front() {
            let p = cal.back_project(x as f32, y as f32, v as f32);
            lo = Point3f::new(lo.x.min(p.x), lo.y.min(p.y), lo.z.min(p.z));
            hi = Point3f::new(hi.x.max(p.x), hi.y.max(p.y), hi.z.max(p.z));
            sum[0] += p.x as f64;
            sum[1] += p.y as f64;
            sum[2] += p.z as f64;
            count += 1;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);

            let neighbours = [
                (x.checked_sub(1), Some(y)),
                (x.checked_add(1), Some(y)),
                (Some(x), y.checked_sub(1)),
                (Some(x), y.checked_add(1)),
            ];
            for (nx, ny) in neighbours {
                let (Some(nx), Some(ny)) = (nx, ny) else {
                    continue;
                };
                if nx < region.x0 || nx >= region.x1 || ny < region.y0 || ny >= region.y1 {
                    continue;
                }
                let li = local(nx, ny);
                if visited[li] {
                    continue;
                }
                let nv = depth.get(nx, ny).copied().unwrap_or(0);
                if nv == 0 || nv > limit || nv.abs_diff(v) > step {
                    continue;
                }
                visited[li] = true;
                queue.push_back((nx, ny, nv));
            }
        }

        let bounding_rect = Rect::new(
            min_x as i32,
            min_y as i32,
            (max_x - min_x + 1) as i32,
            (max_y - min_y + 1) as i32,
        );
        let centre = bounding_rect.centre();
        let n = count.max(1) as f64;
        let centre_world = Point3f::new((sum[0] / n) as f32, (sum[1] / n) as f32, (sum[2] / n) as f32);
        tracing::debug!(
            "nearest obstacle: {}mm rect={:?} pixels={}",
            seed_v,
            bounding_rect,
            count
        );
        Some(Obstacle {
            object: SceneObject {
                distance: Distance::Millimetres(seed_v),
                angle: Direction::Degrees(cal.column_angle_deg(centre.x as f32)),
                bounding_rect,
                centre,
                centre_world: Some(centre_world),
            },
            min_world: lo,
            max_world: hi,
        })
    }

    /// Split the region into vertical bands `band_width` pixels wide and return
    /// the farthest pixel of the band with the largest mean depth.
    pub fn farthest_point(
        &self,
        depth: &DepthField,
        cal: &Calibration,
        roi: Rect,
        band_width: u32,
    ) -> Option<ScenePoint> {
        let region = roi.region(depth.width(), depth.height())?;
        let band_width = band_width.max(1);
        let mut best: Option<(f64, u16, u32, u32)> = None;
        let mut bx = region.x0;
        while bx < region.x1 {
            let ex = (bx + band_width).min(region.x1);
            let mut sum = 0u64;
            let mut n = 0u64;
            let mut far: Option<(u16, u32, u32)> = None;
            for y in region.y0..region.y1 {
                let row = depth.row(y);
                for x in bx..ex {
                    let v = row[x as usize];
                    if v == 0 {
                        continue;
                    }
                    sum += v as u64;
                    n += 1;
                    if far.map_or(true, |(fv, _, _)| v > fv) {
                        far = Some((v, x, y));
                    }
                }
            }
            if let Some((fv, fx, fy)) = far {
                let mean = sum as f64 / n as f64;
                if best.map_or(true, |(m, _, _, _)| mean > m) {
                    best = Some((mean, fv, fx, fy));
                }
            }
            bx = ex;
        }
        let (_, v, x, y) = best?;
        Some(ScenePoint {
            image: Point2i::new(x as i32, y as i32),
            world: cal.back_project(x as f32, y as f32, v as f32),
        })
    }

    /// Heading of the free angular zone closest to straight ahead, or
    /// `Direction::Undefined` when every zone is blocked. Zones with too few
    /// valid pixels (below `dead_zone_min_valid_ratio`) are never free.
    pub fn bypass_direction(
        &self,
        depth: &DepthField,
        cal: &Calibration,
        roi: Rect,
        params: &BypassParams,
    ) -> Direction {
        let zones = params.zone_count;
        let Some(region) = roi.region(depth.width(), depth.height()) else {
            return Direction::Undefined;
        };
        if zones == 0 {
            return Direction::Undefined;
        }
        let fov = cal.params().fov_deg;
        let zone_width = fov / zones as f32;
        let zone_of: Vec<usize> = (region.x0..region.x1)
            .map(|x| {
                let a = cal.column_angle_deg(x as f32) + fov / 2.0;
                ((a / zone_width).floor().max(0.0) as usize).min(zones - 1)
            })
            .collect();

        let mut total = vec![0u64; zones];
        let mut valid = vec![0u64; zones];
        let mut near = vec![0u64; zones];
        for y in region.y0..region.y1 {
            let row = depth.row(y);
            for (i, x) in (region.x0..region.x1).enumerate() {
                let z = zone_of[i];
                let v = row[x as usize];
                total[z] += 1;
                if v != 0 {
                    valid[z] += 1;
                    if v < params.dist_threshold {
                        near[z] += 1;
                    }
                }
            }
        }

        let mut best: Option<(i64, f32, usize)> = None;
        for z in 0..zones {
            if total[z] == 0 {
                continue;
            }
            let point_ratio = near[z] as f32 / total[z] as f32;
            let occupancy = if valid[z] > 0 {
                near[z] as f32 / valid[z] as f32
            } else {
                0.0
            };
            // a zone the sensor cannot see into is not free
            let blind = (valid[z] as f32 / total[z] as f32) < self.config.dead_zone_min_valid_ratio;
            let occupied =
                point_ratio > params.point_ratio_threshold && occupancy > params.occupancy_threshold;
            tracing::trace!(
                "bypass zone {z}: near={} valid={} total={} occupied={occupied} blind={blind}",
                near[z],
                valid[z],
                total[z]
            );
            if occupied || blind {
                continue;
            }
            let centre = zone_centre(fov, zones, z);
            let key = ((centre.abs() * 1000.0).round() as i64, point_ratio, z);
            let better = match best {
                None => true,
                Some((a, r, _)) => key.0 < a || (key.0 == a && key.1 < r),
            };
            if better {
                best = Some(key);
            }
        }
        match best {
            Some((_, _, z)) => Direction::Degrees(zone_centre(fov, zones, z)),
            None => Direction::Undefined,
        }
    }

    pub fn valid_ratio(&self, depth: &DepthField, roi: Rect) -> f32 {
        let Some(region) = roi.region(depth.width(), depth.height()) else {
            return 0.0;
        };
        let mut valid = 0usize;
        for y in region.y0..region.y1 {
            valid += depth.row(y)[region.x0 as usize..region.x1 as usize]
                .iter()
                .filter(|&&v| v != 0)
                .count();
        }
        valid as f32 / region.area() as f32
    }

    /// Too little valid depth to trust any other query.
    pub fn is_dead_zone(&self, depth: &DepthField, roi: Rect) -> bool {
        self.valid_ratio(depth, roi) < self.config.dead_zone_min_valid_ratio
    }

    pub fn scene_info(
        &self,
        depth: &DepthField,
        disp: &DisparityMap,
        cal: &Calibration,
        roi: Rect,
    ) -> SceneInfo {
        let Some(point) = self.nearest_point(depth, cal, roi) else {
            return SceneInfo::default();
        };
        let nearest_disp = disp
            .get(point.image.x as u32, point.image.y as u32)
            .copied()
            .unwrap_or(0);
        SceneInfo {
            nearest_distance: Distance::from_raw(point.world.z.round() as u16),
            nearest_disp,
            nearest_point: Some(point),
            nearest_obstacle: self.nearest_obstacle(depth, cal, roi),
        }
    }
}

fn zone_centre(fov: f32, zones: usize, z: usize) -> f32 {
    -fov / 2.0 + (z as f32 + 0.5) * fov / zones as f32
}

fn nearest_pixel(depth: &DepthField, roi: Rect) -> Option<(u16, u32, u32)> {
    let region = roi.region(depth.width(), depth.height())?;
    let mut best: Option<(u16, u32, u32)> = None;
    for y in region.y0..region.y1 {
        let row = depth.row(y);
        for x in region.x0..region.x1 {
            let v = row[x as usize];
            if v != 0 && best.map_or(true, |(b, _, _)| v < b) {
                best = Some((v, x, y));
            }
        }
    }
    best
}

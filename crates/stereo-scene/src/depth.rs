use crate::calib::Calibration;
use crate::types::{DepthField, DisparityMap, Distance, Frame, Grid, PixelFormat, Point3f, Rect};
use crate::{Error, Result};
use std::fmt::Write as _;

/// Camera-space point per pixel; `None` where there is no depth.
pub type PointCloud = Grid<Option<Point3f>>;

/// Metric depth (mm) via the calibration's disparity table.
pub fn to_depth(disp: &DisparityMap, cal: &Calibration) -> DepthField {
    disp.map(|&d| cal.lookup(d))
}

/// Linear 8-bit rendering of depth for display. 0 stays 0 (no reading);
/// valid readings in `[min, max]` map onto 1..=255.
pub fn to_depth8(depth: &DepthField, min: u16, max: u16) -> Grid<u8> {
    let span = max.saturating_sub(min) as u32;
    depth.map(|&v| {
        if v == 0 {
            return 0;
        }
        if span == 0 {
            return 255;
        }
        let off = (v.clamp(min, max) - min) as u32;
        (1 + off * 254 / span) as u8
    })
}

/// Quantize depth to the nearest multiple of `step` mm. Valid readings never
/// collapse onto the no-reading value; the first band is the smallest output.
pub fn to_discrete_depth(depth: &DepthField, step: f32) -> Result<DepthField> {
    if !(step.is_finite() && step > 0.0) {
        return Err(Error::InvalidParameter(format!(
            "discrete depth step must be positive, got {step}"
        )));
    }
    Ok(depth.map(|&v| {
        if v == 0 {
            return 0;
        }
        let bands = (v as f32 / step).round().max(1.0);
        (bands * step).round().min(u16::MAX as f32) as u16
    }))
}

/// Pinhole back-projection of every pixel.
pub fn to_point_cloud(depth: &DepthField, cal: &Calibration) -> PointCloud {
    let w = depth.width();
    let mut data = Vec::with_capacity(depth.len());
    for y in 0..depth.height() {
        for (x, &v) in depth.row(y).iter().enumerate() {
            if v == 0 {
                data.push(None);
            } else {
                data.push(Some(cal.back_project(x as f32, y as f32, v as f32)));
            }
        }
    }
    // rows are full width, so the length always matches
    Grid::from_vec(w, depth.height(), data).unwrap_or_else(|_| Grid::filled(w, depth.height(), None))
}

/// Write valid points inside `roi` as ASCII PLY (metres). Returns the point count.
pub fn write_ply(cloud: &PointCloud, path: &str, roi: Rect) -> Result<usize> {
    let mut buf = String::new();
    let mut count = 0usize;
    if let Some(r) = roi.region(cloud.width(), cloud.height()) {
        for y in r.y0..r.y1 {
            for x in r.x0..r.x1 {
                if let Some(Some(p)) = cloud.get(x, y) {
                    let m = p.to_metres();
                    let _ = writeln!(buf, "{} {} {}", m.x, m.y, m.z);
                    count += 1;
                }
            }
        }
    }
    let header = format!(
        "ply\nformat ascii 1.0\ncomment generated by stereo-scene\nelement vertex {}\nproperty float x\nproperty float y\nproperty float z\nend_header\n",
        count
    );
    let mut out = String::with_capacity(header.len() + buf.len());
    out.push_str(&header);
    out.push_str(&buf);
    std::fs::write(path, out).map_err(|e| Error::Io(e.to_string()))?;
    Ok(count)
}

/// Colour ramp from red (near) through green to blue (far); black for no reading.
pub fn dist_to_rgb(dist: Distance, min: u16, max: u16) -> [u8; 3] {
    match dist.mm() {
        None => [0, 0, 0],
        Some(mm) => {
            let span = max.saturating_sub(min).max(1) as f32;
            let t = (mm.clamp(min, max.max(min)) - min) as f32 / span;
            ramp(t)
        }
    }
}

/// RGB8 rendering of a disparity map (high disparity = near = red).
pub fn colorize_disparity(disp: &DisparityMap) -> Frame {
    let mut data = Vec::with_capacity(disp.len() * PixelFormat::Rgb8.channels());
    for &d in disp.data() {
        if d == 0 {
            data.extend_from_slice(&[0, 0, 0]);
        } else {
            data.extend_from_slice(&ramp(1.0 - d as f32 / 255.0));
        }
    }
    Frame {
        width: disp.width(),
        height: disp.height(),
        pixel_format: PixelFormat::Rgb8,
        data,
        ts: None,
    }
}

fn ramp(t: f32) -> [u8; 3] {
    let t = t.clamp(0.0, 1.0);
    let r = 255.0 * (1.0 - t);
    let g = 255.0 * (1.0 - (2.0 * t - 1.0).abs());
    let b = 255.0 * t;
    [r.round() as u8, g.round() as u8, b.round() as u8]
}

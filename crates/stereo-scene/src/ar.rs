use crate::calib::Calibration;
use serde::{Deserialize, Serialize};

/// Pinhole intrinsics handed to the marker detector (pixels).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl CameraIntrinsics {
    pub fn from_calibration(cal: &Calibration) -> Self {
        let p = cal.params();
        Self {
            fx: p.focal_px as f64,
            fy: p.focal_px as f64,
            cx: p.cx as f64,
            cy: p.cy as f64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub r: [[f64; 3]; 3],
    /// Translation in metres.
    pub t: [f64; 3],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub id: u32,
    /// Image corners, counter-clockwise from top-left.
    pub corners: [[f32; 2]; 4],
    pub pose: Option<Pose>,
}

/// Which camera of the pair a request refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CameraSide {
    Left,
    Right,
}

impl CameraSide {
    pub fn from_index(camera_num: u8) -> Self {
        if camera_num == 1 {
            CameraSide::Right
        } else {
            CameraSide::Left
        }
    }
}

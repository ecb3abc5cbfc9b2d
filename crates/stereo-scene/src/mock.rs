use crate::calib::CalibrationParams;
use crate::config::CaptureMode;
use crate::traits::{StereoFrame, StereoSource};
use crate::types::{DisparityMap, Frame, Grid, PixelFormat, Rect};
use crate::Result;
use time::OffsetDateTime;

#[derive(Clone, Debug, PartialEq)]
pub struct MockObstacle {
    pub rect: Rect,
    pub distance_mm: u16,
}

/// Synthetic scene rendered straight to disparity: a flat floor below a level
/// camera, an optional back wall and box obstacles facing the camera.
#[derive(Clone, Debug, PartialEq)]
pub struct MockScene {
    pub width: u32,
    pub height: u32,
    pub fov_deg: f32,
    pub baseline_mm: f32,
    /// Camera height above the floor; `None` renders no floor.
    pub camera_height_mm: Option<f32>,
    pub background_mm: Option<u16>,
    pub obstacles: Vec<MockObstacle>,
    /// Add a one-level flicker on odd frames.
    pub jitter: bool,
}

impl Default for MockScene {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fov_deg: 60.0,
            baseline_mm: 60.0,
            camera_height_mm: Some(600.0),
            background_mm: Some(5000),
            obstacles: vec![MockObstacle {
                rect: Rect::new(280, 180, 80, 200),
                distance_mm: 1200,
            }],
            jitter: true,
        }
    }
}

impl MockScene {
    pub fn render(&self, frame_index: u64) -> DisparityMap {
        let p = CalibrationParams::from_fov(self.width, self.height, self.fov_deg, self.baseline_mm);
        let bf = self.baseline_mm * p.focal_px;
        let wall = self.background_mm.map_or(0.0, |mm| bf / mm.max(1) as f32);
        let mut out = Grid::filled(self.width, self.height, 0u8);
        for y in 0..self.height {
            let floor = match self.camera_height_mm {
                Some(h) if (y as f32) > p.cy && h > 0.0 => self.baseline_mm * (y as f32 - p.cy) / h,
                _ => 0.0,
            };
            for x in 0..self.width {
                let mut d = floor.max(wall);
                for ob in &self.obstacles {
                    let od = bf / ob.distance_mm.max(1) as f32;
                    if od > d && ob.rect.contains(crate::Point2i::new(x as i32, y as i32)) {
                        d = od;
                    }
                }
                let mut v = d.round().clamp(0.0, 255.0) as u8;
                if self.jitter && frame_index % 2 == 1 && v > 0 && v < 255 && (x + y) % 7 == 0 {
                    v += 1;
                }
                if let Some(px) = out.get_mut(x, y) {
                    *px = v;
                }
            }
        }
        out
    }
}

pub struct MockStereoSource {
    scene: MockScene,
    mode: CaptureMode,
    counter: u64,
}

impl MockStereoSource {
    pub fn new(scene: MockScene) -> Self {
        Self {
            scene,
            mode: CaptureMode::DepthLeft,
            counter: 0,
        }
    }

    fn gray_ramp(&self) -> Frame {
        let (width, height) = (self.scene.width, self.scene.height);
        let mut data = vec![0u8; (width * height) as usize];
        for y in 0..height {
            for x in 0..width {
                let idx = (y * width + x) as usize;
                data[idx] = ((x + y + self.counter as u32) % 256) as u8;
            }
        }
        Frame {
            width,
            height,
            pixel_format: PixelFormat::Gray8,
            data,
            ts: Some(OffsetDateTime::now_utc()),
        }
    }
}

impl StereoSource for MockStereoSource {
    fn open(_spec: &str) -> Result<Self> {
        Ok(Self::new(MockScene::default()))
    }

    fn configure(&mut self, mode: CaptureMode, width: u32, height: u32, _rate: u8) -> Result<()> {
        self.mode = mode;
        self.scene.width = width;
        self.scene.height = height;
        Ok(())
    }

    fn read(&mut self) -> Result<StereoFrame> {
        let disparity = self
            .mode
            .wants_depth()
            .then(|| self.scene.render(self.counter));
        let left = self.mode.wants_left().then(|| self.gray_ramp());
        let right = self.mode.wants_right().then(|| self.gray_ramp());
        self.counter += 1;
        Ok(StereoFrame {
            left,
            right,
            disparity,
            ts: Some(OffsetDateTime::now_utc()),
        })
    }
}

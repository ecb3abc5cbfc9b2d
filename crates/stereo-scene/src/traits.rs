use crate::ar::{CameraIntrinsics, Marker};
use crate::config::CaptureMode;
use crate::scene::Biometrics;
use crate::types::{DisparityMap, Frame, Rect};
use crate::Result;
use time::OffsetDateTime;

/// One synchronized capture from the stereo device.
#[derive(Clone, Debug)]
pub struct StereoFrame {
    pub left: Option<Frame>,
    pub right: Option<Frame>,
    /// Raw 8-bit disparity; 0 marks pixels without correspondence.
    pub disparity: Option<DisparityMap>,
    pub ts: Option<OffsetDateTime>,
}

pub trait StereoSource {
    /// Open a stereo device by index or path string.
    fn open(spec: &str) -> Result<Self>
    where
        Self: Sized;

    /// Select which images subsequent reads produce.
    fn configure(&mut self, _mode: CaptureMode, _width: u32, _height: u32, _rate: u8) -> Result<()> {
        Ok(())
    }

    /// Read a single synchronized frame.
    fn read(&mut self) -> Result<StereoFrame>;
}

/// External people detection and labelling.
pub trait BiometricsService {
    /// Locate people in a colour image; one rectangle per person.
    fn detect(&mut self, image: &Frame) -> Result<Vec<Rect>>;

    /// Estimate labels for the person inside `region`.
    fn estimate(&mut self, image: &Frame, region: Rect) -> Result<Biometrics>;
}

/// External fiducial marker detection and pose estimation.
pub trait MarkerDetector {
    fn detect(
        &mut self,
        image: &Frame,
        intrinsics: &CameraIntrinsics,
        marker_size_m: f32,
    ) -> Result<Vec<Marker>>;
}

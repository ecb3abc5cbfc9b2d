//! stereo-scene: calibrated stereo depth pipeline and scene queries for mobile navigation

mod types;
pub use types::{
    DepthField, Direction, DisparityMap, Distance, Frame, Grid, PixelFormat, Point2i, Point3f,
    Rect, DISPARITY_COUNT, MAX_DISTANCE, NO_ANGLE, NO_DISTANCE,
};

mod error;
pub use error::{Error, Result};

mod traits;
pub use traits::{BiometricsService, MarkerDetector, StereoFrame, StereoSource};

#[cfg(feature = "mock")]
mod mock;
#[cfg(feature = "mock")]
pub use mock::{MockObstacle, MockScene, MockStereoSource};

mod config;
pub use config::{CaptureMode, SensorConfig};

mod metrics;
pub use metrics::PipelineMetrics;

mod sensor;
pub use sensor::{FrameReport, SceneSensor};

/// Disparity to distance lookup and pinhole geometry
pub mod calib;
pub use calib::{Calibration, CalibrationParams};

pub mod disparity;
pub mod depth;
pub mod floor;
pub mod scene;
pub mod measure;

/// Marker types shared with the external detector
pub mod ar;

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

#[derive(Clone)]
pub struct PipelineMetrics {
    pub registry: Registry,
    pub frames_processed: IntCounter,
    pub dead_zone_frames: IntCounter,
    pub floor_fit_failures: IntCounter,
    pub valid_pixel_permille: IntGauge,
}

impl PipelineMetrics {
    pub fn new() -> Result<Self, String> {
        let registry = Registry::new();
        let frames_processed =
            IntCounter::new("scene_frames_processed", "Frames run through the depth pipeline")
                .map_err(|e| format!("metrics init error: {e}"))?;
        let dead_zone_frames =
            IntCounter::new("scene_dead_zone_frames", "Frames with too little valid depth")
                .map_err(|e| format!("metrics init error: {e}"))?;
        let floor_fit_failures = IntCounter::new(
            "scene_floor_fit_failures",
            "Frames where the ground model could not be fitted",
        )
        .map_err(|e| format!("metrics init error: {e}"))?;
        let valid_pixel_permille = IntGauge::new(
            "scene_valid_pixel_permille",
            "Share of valid depth pixels in the last frame (per mille)",
        )
        .map_err(|e| format!("metrics init error: {e}"))?;
        let _ = registry.register(Box::new(frames_processed.clone()));
        let _ = registry.register(Box::new(dead_zone_frames.clone()));
        let _ = registry.register(Box::new(floor_fit_failures.clone()));
        let _ = registry.register(Box::new(valid_pixel_permille.clone()));
        Ok(Self {
            registry,
            frames_processed,
            dead_zone_frames,
            floor_fit_failures,
            valid_pixel_permille,
        })
    }

    pub fn record_valid_ratio(&self, ratio: f32) {
        self.valid_pixel_permille
            .set((ratio.clamp(0.0, 1.0) * 1000.0).round() as i64);
    }

    pub fn encode_text(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            return format!("error encoding metrics: {e}");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

use crate::types::DisparityMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Largest frame-to-frame change (disparity levels) treated as flicker.
    pub temporal_threshold: u8,
    /// Drop valid pixels that have no valid 4-neighbour.
    pub remove_speckles: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            temporal_threshold: 2,
            remove_speckles: true,
        }
    }
}

/// Temporal disparity filter with one frame of history.
///
/// Small per-pixel changes are averaged with the previous raw frame to
/// suppress flicker; larger changes are taken as real motion and passed
/// through untouched. Pixels without correspondence (0) are never filled in.
///
/// History follows the raw stream: `push` records each captured frame and
/// `filter` only reads, so filtering a frame twice gives the same result.
#[derive(Debug, Default)]
pub struct DisparityFilter {
    config: FilterConfig,
    prev: Option<DisparityMap>,
    current: Option<DisparityMap>,
}

impl DisparityFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self {
            config,
            prev: None,
            current: None,
        }
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    pub fn reset(&mut self) {
        self.prev = None;
        self.current = None;
    }

    /// Whether the current frame has a predecessor to smooth against.
    pub fn has_history(&self) -> bool {
        self.prev.is_some()
    }

    /// Record a newly captured raw frame; the one it replaces becomes history.
    pub fn push(&mut self, raw: &DisparityMap) {
        self.prev = self.current.replace(raw.clone());
    }

    /// Filter `raw` against the frame before the current one.
    pub fn filter(&self, raw: &DisparityMap) -> DisparityMap {
        let mut out = raw.clone();
        match self.prev.as_ref() {
            Some(prev) if prev.same_dims(raw) => {
                let th = self.config.temporal_threshold;
                for (o, &p) in out.data_mut().iter_mut().zip(prev.data()) {
                    let c = *o;
                    if c == 0 || p == 0 {
                        continue;
                    }
                    if c.abs_diff(p) <= th {
                        *o = ((c as u16 + p as u16 + 1) / 2) as u8;
                    }
                }
            }
            Some(_) => {
                tracing::debug!("disparity size changed; skipping temporal filter");
            }
            None => {}
        }
        if self.config.remove_speckles {
            remove_speckles(&mut out);
        }
        out
    }

    /// `push` then `filter`.
    pub fn apply(&mut self, raw: &DisparityMap) -> DisparityMap {
        self.push(raw);
        self.filter(raw)
    }
}

/// Zero out isolated valid pixels (no valid 4-neighbour).
pub fn remove_speckles(disp: &mut DisparityMap) -> usize {
    let (w, h) = (disp.width(), disp.height());
    if w < 2 || h < 2 {
        return 0;
    }
    let src = disp.clone();
    let valid = |x: u32, y: u32| src.get(x, y).is_some_and(|&v| v != 0);
    let mut removed = 0;
    for y in 0..h {
        for x in 0..w {
            if !valid(x, y) {
                continue;
            }
            let has_neighbour = (x > 0 && valid(x - 1, y))
                || valid(x + 1, y)
                || (y > 0 && valid(x, y - 1))
                || valid(x, y + 1);
            if !has_neighbour {
                if let Some(v) = disp.get_mut(x, y) {
                    *v = 0;
                    removed += 1;
                }
            }
        }
    }
    removed
}

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Raw distance value meaning "no stereo correspondence / no measurement".
pub const NO_DISTANCE: u16 = 0;
/// Upper bound on any distance the pipeline reports (mm).
pub const MAX_DISTANCE: u16 = 10_000;
/// Raw angle value meaning "undefined direction".
pub const NO_ANGLE: f32 = 361.0;
/// Number of 8-bit disparity levels.
pub const DISPARITY_COUNT: usize = 256;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum PixelFormat {
    Bgr8,
    Rgb8,
    Gray8,
}

impl PixelFormat {
    pub fn channels(self) -> usize {
        match self {
            PixelFormat::Bgr8 | PixelFormat::Rgb8 => 3,
            PixelFormat::Gray8 => 1,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub data: Vec<u8>,
    pub ts: Option<OffsetDateTime>,
}

/// Dense row-major 2D buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct Grid<T> {
    width: u32,
    height: u32,
    data: Vec<T>,
}

pub type DisparityMap = Grid<u8>;
pub type DepthField = Grid<u16>;

impl<T: Clone> Grid<T> {
    pub fn filled(width: u32, height: u32, value: T) -> Self {
        Self {
            width,
            height,
            data: vec![value; width as usize * height as usize],
        }
    }
}

impl<T> Grid<T> {
    pub fn from_vec(width: u32, height: u32, data: Vec<T>) -> Result<Self> {
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(Error::DimensionMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn get(&self, x: u32, y: u32) -> Option<&T> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.data.get(self.index(x, y))
    }

    pub fn get_mut(&mut self, x: u32, y: u32) -> Option<&mut T> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = self.index(x, y);
        self.data.get_mut(idx)
    }

    pub fn row(&self, y: u32) -> &[T] {
        let start = (y.min(self.height) as usize) * self.width as usize;
        let end = (start + self.width as usize).min(self.data.len());
        &self.data[start..end]
    }

    pub fn same_dims<U>(&self, other: &Grid<U>) -> bool {
        self.width == other.width && self.height == other.height
    }

    pub fn map<U>(&self, f: impl FnMut(&T) -> U) -> Grid<U> {
        Grid {
            width: self.width,
            height: self.height,
            data: self.data.iter().map(f).collect(),
        }
    }

    pub(crate) fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }
}

impl Grid<u8> {
    /// Mono8 layout, one byte per pixel, row-major.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl Grid<u16> {
    /// Mono16 layout, little-endian, row-major.
    pub fn to_mono16_le(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() * 2);
        for v in &self.data {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point2i {
    pub x: i32,
    pub y: i32,
}

impl Point2i {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Camera-space point in millimetres (x right, y down, z forward).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Point3f {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Point3f {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn to_metres(self) -> Self {
        Self::new(self.x / 1000.0, self.y / 1000.0, self.z / 1000.0)
    }
}

/// Image-space rectangle. An empty rectangle selects the whole frame
/// wherever it is used as a region of interest.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    pub fn centre(&self) -> Point2i {
        Point2i::new(self.x + self.width / 2, self.y + self.height / 2)
    }

    pub fn contains(&self, p: Point2i) -> bool {
        p.x >= self.x && p.y >= self.y && p.x < self.x + self.width && p.y < self.y + self.height
    }

    /// Resolve against a frame: empty selects everything, otherwise clip.
    /// `None` when the rectangle lies entirely outside the frame.
    pub(crate) fn region(&self, width: u32, height: u32) -> Option<Region> {
        if width == 0 || height == 0 {
            return None;
        }
        if self.is_empty() {
            return Some(Region {
                x0: 0,
                y0: 0,
                x1: width,
                y1: height,
            });
        }
        let x0 = self.x.max(0) as i64;
        let y0 = self.y.max(0) as i64;
        let x1 = (self.x as i64 + self.width as i64).min(width as i64);
        let y1 = (self.y as i64 + self.height as i64).min(height as i64);
        if x0 >= x1 || y0 >= y1 {
            return None;
        }
        Some(Region {
            x0: x0 as u32,
            y0: y0 as u32,
            x1: x1 as u32,
            y1: y1 as u32,
        })
    }
}

/// Clipped pixel bounds, end-exclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Region {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl Region {
    pub fn area(&self) -> usize {
        (self.x1 - self.x0) as usize * (self.y1 - self.y0) as usize
    }
}

/// A distance reading that cannot be confused with its sentinel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Distance {
    NoReading,
    Millimetres(u16),
}

impl Distance {
    pub fn from_raw(raw: u16) -> Self {
        if raw == NO_DISTANCE {
            Distance::NoReading
        } else {
            Distance::Millimetres(raw)
        }
    }

    /// Wire value; `NO_DISTANCE` for no reading.
    pub fn raw(self) -> u16 {
        match self {
            Distance::NoReading => NO_DISTANCE,
            Distance::Millimetres(mm) => mm,
        }
    }

    pub fn mm(self) -> Option<u16> {
        match self {
            Distance::NoReading => None,
            Distance::Millimetres(mm) => Some(mm),
        }
    }

    pub fn metres(self) -> Option<f32> {
        self.mm().map(|mm| mm as f32 / 1000.0)
    }

    pub fn is_reading(self) -> bool {
        matches!(self, Distance::Millimetres(_))
    }
}

/// Horizontal direction in degrees, positive to the right of the optical axis.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Direction {
    Undefined,
    Degrees(f32),
}

impl Direction {
    /// Wire value; `NO_ANGLE` when undefined.
    pub fn raw(self) -> f32 {
        match self {
            Direction::Undefined => NO_ANGLE,
            Direction::Degrees(d) => d,
        }
    }

    pub fn degrees(self) -> Option<f32> {
        match self {
            Direction::Undefined => None,
            Direction::Degrees(d) => Some(d),
        }
    }
}

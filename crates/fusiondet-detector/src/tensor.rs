//! Dense tensors exchanged between pipeline stages.
//!
//! [`FeatureMap`] is a row-major `(batch, channels, height, width)` buffer;
//! [`ImageBatch`] holds multi-view camera input in either
//! `(B, N_views, C, H, W)` or pre-flattened `(B * N_views, C, H, W)` layout.

use fusiondet_types::FusionError;
use fusiondet_voxel::HeightGrids;

// ────────────────────────────────────────────────────────────────────────────
// FeatureMap
// ────────────────────────────────────────────────────────────────────────────

/// Row-major `(B, C, H, W)` feature tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMap {
    shape: [usize; 4],
    data: Vec<f32>,
}

impl FeatureMap {
    pub fn zeros(shape: [usize; 4]) -> Self {
        Self::filled(shape, 0.0)
    }

    pub fn filled(shape: [usize; 4], value: f32) -> Self {
        Self {
            shape,
            data: vec![value; shape.iter().product()],
        }
    }

    /// Wrap an existing buffer whose length must match `shape`.
    pub fn from_vec(shape: [usize; 4], data: Vec<f32>) -> Result<Self, FusionError> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(FusionError::ShapeMismatch(format!(
                "feature map {shape:?} needs {expected} values, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }

    pub fn batch(&self) -> usize {
        self.shape[0]
    }

    pub fn channels(&self) -> usize {
        self.shape[1]
    }

    pub fn height(&self) -> usize {
        self.shape[2]
    }

    pub fn width(&self) -> usize {
        self.shape[3]
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    fn offset(&self, b: usize, c: usize, y: usize, x: usize) -> usize {
        ((b * self.shape[1] + c) * self.shape[2] + y) * self.shape[3] + x
    }

    /// Value at `(b, c, y, x)`, or `None` when out of bounds.
    pub fn get(&self, b: usize, c: usize, y: usize, x: usize) -> Option<f32> {
        let [nb, nc, ny, nx] = self.shape;
        if b >= nb || c >= nc || y >= ny || x >= nx {
            return None;
        }
        Some(self.data[self.offset(b, c, y, x)])
    }

    /// Mutable value at `(b, c, y, x)`, or `None` when out of bounds.
    pub fn get_mut(&mut self, b: usize, c: usize, y: usize, x: usize) -> Option<&mut f32> {
        let [nb, nc, ny, nx] = self.shape;
        if b >= nb || c >= nc || y >= ny || x >= nx {
            return None;
        }
        let i = self.offset(b, c, y, x);
        Some(&mut self.data[i])
    }

    /// Append single-channel `(B, H, W)` planes after the existing channels.
    pub fn concat_channels(&self, planes: &[&[f32]]) -> Result<FeatureMap, FusionError> {
        let [b, c, h, w] = self.shape;
        let plane_len = b * h * w;
        if let Some(bad) = planes.iter().find(|p| p.len() != plane_len) {
            return Err(FusionError::ShapeMismatch(format!(
                "channel plane has {} values, expected {plane_len} for ({b}, {h}, {w})",
                bad.len()
            )));
        }

        let hw = h * w;
        let out_c = c + planes.len();
        let mut data = Vec::with_capacity(b * out_c * hw);
        for sample in 0..b {
            data.extend_from_slice(&self.data[sample * c * hw..(sample + 1) * c * hw]);
            for plane in planes {
                data.extend_from_slice(&plane[sample * hw..(sample + 1) * hw]);
            }
        }
        FeatureMap::from_vec([b, out_c, h, w], data)
    }

    /// Append the min and max height planes as two extra channels.
    pub fn with_height_channels(&self, heights: &HeightGrids) -> Result<FeatureMap, FusionError> {
        let (hb, hy, hx) = heights.shape();
        let [b, _, h, w] = self.shape;
        if (hb, hy, hx) != (b, h, w) {
            return Err(FusionError::ShapeMismatch(format!(
                "height grids ({hb}, {hy}, {hx}) do not match feature map ({b}, {h}, {w})"
            )));
        }
        self.concat_channels(&[heights.min_plane(), heights.max_plane()])
    }
}

// ────────────────────────────────────────────────────────────────────────────
// ImageBatch
// ────────────────────────────────────────────────────────────────────────────

/// Multi-view camera input.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageBatch {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl ImageBatch {
    /// Accepts `(B, N, C, H, W)` or `(B * N, C, H, W)`.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, FusionError> {
        if shape.len() != 4 && shape.len() != 5 {
            return Err(FusionError::ShapeMismatch(format!(
                "image batch must be 4-D or 5-D, got shape {shape:?}"
            )));
        }
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(FusionError::ShapeMismatch(format!(
                "image batch {shape:?} needs {expected} values, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Per-view input resolution `(H, W)`.
    pub fn input_shape(&self) -> (usize, usize) {
        let n = self.shape.len();
        (self.shape[n - 2], self.shape[n - 1])
    }

    /// Collapse the view axis: `(B, N, C, H, W)` becomes `(B * N, C, H, W)`.
    ///
    /// 4-D input is returned unchanged.
    pub fn flatten_views(self) -> ImageBatch {
        if let [b, n, c, h, w] = self.shape[..] {
            return ImageBatch {
                shape: vec![b * n, c, h, w],
                data: self.data,
            };
        }
        self
    }
}

use glam::Vec3;

use crate::error::FoamError;

pub const VERTEX_ELEMENT: &str = "vertex";
pub const ADJACENCY_ELEMENT: &str = "adjacency";
pub const ADJACENCY_PROPERTY: &str = "adjacency";
pub const DENSITY_PROPERTY: &str = "density";
pub const OFFSET_PROPERTY: &str = "adjacency_offset";
pub const COLOR_PREFIX: &str = "color_sh_";

/// Number of base color channels stored ahead of the higher-order coefficients.
pub const DC_DIM: usize = 3;

/// A radiance foam scene in columnar form.
///
/// `offsets`/`neighbors` form a CSR adjacency graph over the points:
/// the neighbors of point `i` are `neighbors[offsets[i]..offsets[i + 1]]`.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SceneRecord {
    pub num_points: usize,
    /// Number of higher-order color coefficients per point (K).
    pub higher_dim: usize,
    pub points: Vec<f32>,
    pub density: Vec<f32>,
    pub color_dc: Vec<f32>,
    pub color_higher: Vec<f32>,
    pub offsets: Vec<u32>,
    pub neighbors: Vec<u32>,
}

impl SceneRecord {
    pub fn num_edges(&self) -> usize {
        self.neighbors.len()
    }

    pub fn point(&self, i: usize) -> Vec3 {
        Vec3::from_slice(&self.points[i * 3..i * 3 + 3])
    }

    pub fn neighbors_of(&self, i: usize) -> &[u32] {
        &self.neighbors[self.offsets[i] as usize..self.offsets[i + 1] as usize]
    }

    /// Checks that every column agrees on `num_points`.
    pub fn check_shapes(&self) -> Result<(), FoamError> {
        let n = self.num_points;
        let check_len = |name: &str, got: usize, want: usize| {
            if got == want {
                Ok(())
            } else {
                Err(FoamError::consistency(format!(
                    "{name} has {got} values, expected {want} for {n} points"
                )))
            }
        };
        check_len("points", self.points.len(), n * 3)?;
        check_len("density", self.density.len(), n)?;
        check_len("color_dc", self.color_dc.len(), n * DC_DIM)?;
        check_len("color_higher", self.color_higher.len(), n * self.higher_dim)?;
        check_len("offsets", self.offsets.len(), n + 1)?;
        let last = self.offsets[n] as usize;
        check_len("neighbors", self.neighbors.len(), last)
    }

    /// Checks the CSR invariants: offsets start at 0 and never decrease,
    /// and every neighbor index refers to an existing point.
    pub fn check_graph(&self) -> Result<(), FoamError> {
        if self.offsets.first().copied().unwrap_or(0) != 0 {
            return Err(FoamError::consistency("offsets must start at 0"));
        }
        if let Some(i) = self.offsets.windows(2).position(|w| w[0] > w[1]) {
            return Err(FoamError::consistency(format!(
                "offsets decrease at point {}: {} > {}",
                i,
                self.offsets[i],
                self.offsets[i + 1]
            )));
        }
        let n = self.num_points as u64;
        if let Some(pos) = self.neighbors.iter().position(|&v| v as u64 >= n) {
            return Err(FoamError::consistency(format!(
                "neighbor index {} at edge {} is out of range for {} points",
                self.neighbors[pos], pos, n
            )));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), FoamError> {
        self.check_shapes()?;
        self.check_graph()
    }
}

/// Borrowed snapshot of the geometry a renderer traverses.
#[derive(Debug, Clone, Copy)]
pub struct TraceData<'a> {
    pub points: &'a [f32],
    pub density: &'a [f32],
    pub color_dc: &'a [f32],
    pub color_higher: &'a [f32],
    pub offsets: &'a [u32],
    pub neighbors: &'a [u32],
}

impl<'a> From<&'a SceneRecord> for TraceData<'a> {
    fn from(scene: &'a SceneRecord) -> Self {
        Self {
            points: &scene.points,
            density: &scene.density,
            color_dc: &scene.color_dc,
            color_higher: &scene.color_higher,
            offsets: &scene.offsets,
            neighbors: &scene.neighbors,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ray {
    pub origin: Vec3,
    pub direction: Vec3,
}

impl Ray {
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        Self { origin, direction }
    }
}

/// All camera rays of one held-out image, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct RayImage {
    pub width: u32,
    pub height: u32,
    pub rays: Vec<Ray>,
}

/// Ground-truth colors of one held-out image, row-major, channels in [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct ColorImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<[f32; 3]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    pub fn label(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Test => "test",
        }
    }

    pub fn parse(value: &str) -> Result<Self, FoamError> {
        match value {
            "train" => Ok(Split::Train),
            "test" => Ok(Split::Test),
            other => Err(FoamError::Config(format!("unknown split: {other}"))),
        }
    }
}

/// Rays and ground-truth colors of a data split, aligned by image index.
#[derive(Debug, Clone, Default)]
pub struct SplitData {
    pub rays: Vec<RayImage>,
    pub rgbs: Vec<ColorImage>,
}

/// Source of held-out rays and colors.
pub trait DataHandler {
    fn reload(&mut self, split: Split, downsample: u32) -> Result<SplitData, FoamError>;
}

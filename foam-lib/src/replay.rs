//! File-backed collaborators for running an evaluation without a renderer
//! linked in: held-out rays and colors, and renderer outputs cached by an
//! external process. Both are binary PLY files whose header comments carry
//! the image layout (`image_size W H`, `image_count M`); rows are pixels in
//! image order, row-major within each image.

use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};

use glam::Vec3;
use tracing::{debug, info};

use crate::error::FoamError;
use crate::eval::{nearest_points, PrimalAttributes, RenderableModel};
use crate::ply::{self, put, ElementDef, PlyHeader, ScalarKind};
use crate::structures::{
    ColorImage, DataHandler, Ray, RayImage, SceneRecord, Split, SplitData, TraceData,
};

const RAY_ELEMENT: &str = "ray";
const SAMPLE_ELEMENT: &str = "sample";
const RAY_FIELDS: [&str; 9] = ["ox", "oy", "oz", "dx", "dy", "dz", "r", "g", "b"];
const SAMPLE_FIELDS: [&str; 4] = ["r", "g", "b", "alpha"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Layout {
    width: usize,
    height: usize,
    count: usize,
    pixels: usize,
    rows: usize,
}

impl Layout {
    fn new(width: usize, height: usize, count: usize) -> Result<Self, FoamError> {
        let pixels = width
            .checked_mul(height)
            .ok_or_else(|| FoamError::format("image layout overflows"))?;
        let rows = pixels
            .checked_mul(count)
            .ok_or_else(|| FoamError::format("image layout overflows"))?;
        if pixels == 0 && count > 0 {
            return Err(FoamError::format(format!(
                "{} images of {}x{} have no pixels",
                count, width, height
            )));
        }
        Ok(Self {
            width,
            height,
            count,
            pixels,
            rows,
        })
    }

    fn pixels(&self) -> usize {
        self.pixels
    }

    fn from_header(header: &PlyHeader) -> Result<Self, FoamError> {
        let size = header
            .comment_values("image_size")
            .ok_or_else(|| FoamError::format("missing 'comment image_size W H'"))?;
        let count = header
            .comment_values("image_count")
            .ok_or_else(|| FoamError::format("missing 'comment image_count M'"))?;
        let number = |v: Option<&&str>, what: &str| -> Result<usize, FoamError> {
            v.and_then(|s| s.parse().ok())
                .ok_or_else(|| FoamError::format(format!("bad {} in header comment", what)))
        };
        Self::new(
            number(size.first(), "image width")?,
            number(size.get(1), "image height")?,
            number(count.first(), "image count")?,
        )
    }

    fn comments(&self) -> Vec<String> {
        vec![
            format!("image_size {} {}", self.width, self.height),
            format!("image_count {}", self.count),
        ]
    }

    /// Pixel indices kept when taking every `factor`-th pixel in x and y.
    /// Empty when there are no images, whatever the declared size.
    fn downsample(&self, factor: u32) -> (Vec<usize>, usize, usize) {
        let d = factor.max(1) as usize;
        let width = self.width.div_ceil(d);
        let height = self.height.div_ceil(d);
        if self.count == 0 {
            return (Vec::new(), width, height);
        }
        let mut kept = Vec::with_capacity(width * height);
        for y in (0..self.height).step_by(d) {
            for x in (0..self.width).step_by(d) {
                kept.push(y * self.width + x);
            }
        }
        (kept, width, height)
    }
}

/// Reads one element's float columns, checking the row count against the layout.
fn read_rows(
    raw_data: &[u8],
    element: &str,
    fields: &[&str],
) -> Result<(Layout, Vec<f32>), FoamError> {
    let (header, offset) = ply::parse_header(raw_data)?;
    let layout = Layout::from_header(&header)?;
    let views = ply::split_body(&header, &raw_data[offset..])?;
    let view = views
        .get(element)
        .ok_or_else(|| FoamError::format(format!("missing '{}' element", element)))?;
    if view.len() != layout.rows {
        return Err(FoamError::format(format!(
            "'{}' has {} rows, expected {} images of {}x{}",
            element,
            view.len(),
            layout.count,
            layout.width,
            layout.height
        )));
    }
    Ok((layout, view.interleaved_f32(fields)?))
}

fn write_rows(
    path: &Path,
    element: &str,
    fields: &[&str],
    layout: Layout,
    rows: &[f32],
) -> Result<(), FoamError> {
    let mut def = ElementDef::new(element, layout.rows);
    for field in fields {
        def = def.with_property(*field, ScalarKind::Float);
    }
    let header = PlyHeader {
        comments: layout.comments(),
        elements: vec![def],
    };
    let mut out = Vec::with_capacity(rows.len() * 4 + 256);
    header.write(&mut out)?;
    put(&mut out, rows);
    fs::write(path, &out)?;
    Ok(())
}

/// Held-out rays and colors stored as `{data_dir}/{split}_rays.ply`.
#[derive(Debug, Clone)]
pub struct ReplayDataset {
    data_dir: PathBuf,
}

impl ReplayDataset {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn split_path(&self, split: Split) -> PathBuf {
        self.data_dir.join(format!("{}_rays.ply", split.label()))
    }

    /// Writes `data` in the layout [`DataHandler::reload`] expects. All images must share one size.
    pub fn write_split(&self, split: Split, data: &SplitData) -> Result<(), FoamError> {
        let first = data
            .rays
            .first()
            .ok_or_else(|| FoamError::consistency("no images to write"))?;
        let layout = Layout::new(
            first.width as usize,
            first.height as usize,
            data.rays.len(),
        )?;
        if data.rgbs.len() != data.rays.len() {
            return Err(FoamError::consistency(format!(
                "{} ray images but {} color images",
                data.rays.len(),
                data.rgbs.len()
            )));
        }

        let mut rows = Vec::with_capacity(layout.rows * RAY_FIELDS.len());
        for (rays, rgbs) in data.rays.iter().zip(&data.rgbs) {
            if rays.rays.len() != layout.pixels() || rgbs.pixels.len() != layout.pixels() {
                return Err(FoamError::consistency(
                    "all images in a split must share one size",
                ));
            }
            for (ray, rgb) in rays.rays.iter().zip(&rgbs.pixels) {
                rows.extend_from_slice(&ray.origin.to_array());
                rows.extend_from_slice(&ray.direction.to_array());
                rows.extend_from_slice(rgb);
            }
        }

        fs::create_dir_all(&self.data_dir)?;
        write_rows(&self.split_path(split), RAY_ELEMENT, &RAY_FIELDS, layout, &rows)
    }
}

impl DataHandler for ReplayDataset {
    #[tracing::instrument(skip(self), fields(dir = %self.data_dir.display()))]
    fn reload(&mut self, split: Split, downsample: u32) -> Result<SplitData, FoamError> {
        let path = self.split_path(split);
        let raw_data = fs::read(&path)?;
        let (layout, rows) = read_rows(&raw_data, RAY_ELEMENT, &RAY_FIELDS)?;
        let (kept, width, height) = layout.downsample(downsample);

        let stride = RAY_FIELDS.len();
        let mut data = SplitData::default();
        for image in 0..layout.count {
            let base = image * layout.pixels();
            let mut rays = Vec::with_capacity(kept.len());
            let mut pixels = Vec::with_capacity(kept.len());
            for &p in &kept {
                let row = &rows[(base + p) * stride..(base + p + 1) * stride];
                rays.push(Ray::new(
                    Vec3::from_slice(&row[0..3]),
                    Vec3::from_slice(&row[3..6]),
                ));
                pixels.push([row[6], row[7], row[8]]);
            }
            data.rays.push(RayImage {
                width: width as u32,
                height: height as u32,
                rays,
            });
            data.rgbs.push(ColorImage {
                width: width as u32,
                height: height as u32,
                pixels,
            });
        }

        info!(
            "Loaded {} {} images at {}x{} from {}",
            layout.count,
            split.label(),
            width,
            height,
            path.display()
        );
        Ok(data)
    }
}

/// A scene paired with renderer outputs captured by an external renderer.
///
/// `render` hands out the cached images in order, one per call, so it must
/// be driven by a single sequential evaluation pass.
#[derive(Debug)]
pub struct ReplayModel {
    scene: SceneRecord,
    renders: Vec<Vec<[f32; 4]>>,
    cursor: Cell<usize>,
}

impl ReplayModel {
    pub fn new(scene: SceneRecord, renders: Vec<Vec<[f32; 4]>>) -> Self {
        Self {
            scene,
            renders,
            cursor: Cell::new(0),
        }
    }

    pub fn render_cache_path(checkpoint: &Path, split: Split) -> PathBuf {
        checkpoint.join(format!("{}_renders.ply", split.label()))
    }

    pub fn load(scene: SceneRecord, cache: &Path, downsample: u32) -> Result<Self, FoamError> {
        let raw_data = fs::read(cache)?;
        let (layout, rows) = read_rows(&raw_data, SAMPLE_ELEMENT, &SAMPLE_FIELDS)?;
        let (kept, _, _) = layout.downsample(downsample);

        let renders = (0..layout.count)
            .map(|image| {
                let base = image * layout.pixels();
                kept.iter()
                    .map(|&p| {
                        let at = (base + p) * 4;
                        [rows[at], rows[at + 1], rows[at + 2], rows[at + 3]]
                    })
                    .collect()
            })
            .collect::<Vec<Vec<_>>>();
        debug!("Loaded {} cached renders from {}", renders.len(), cache.display());
        Ok(Self::new(scene, renders))
    }

    /// Writes renderer outputs in the layout [`ReplayModel::load`] reads.
    pub fn write_cache(
        path: &Path,
        width: u32,
        height: u32,
        renders: &[Vec<[f32; 4]>],
    ) -> Result<(), FoamError> {
        let layout = Layout::new(width as usize, height as usize, renders.len())?;
        if renders.iter().any(|r| r.len() != layout.pixels()) {
            return Err(FoamError::consistency(format!(
                "every cached render must have {}x{} samples",
                width, height
            )));
        }
        let rows: Vec<f32> = renders.iter().flatten().flatten().copied().collect();
        write_rows(path, SAMPLE_ELEMENT, &SAMPLE_FIELDS, layout, &rows)
    }

    pub fn scene(&self) -> &SceneRecord {
        &self.scene
    }
}

impl RenderableModel for ReplayModel {
    fn trace_data(&self) -> TraceData<'_> {
        TraceData::from(&self.scene)
    }

    fn starting_points(&self, origins: &[Vec3], points: &[f32]) -> Result<Vec<u32>, FoamError> {
        nearest_points(origins, points)
    }

    fn render(&self, rays: &[Ray], _start_point: u32) -> Result<Vec<[f32; 4]>, FoamError> {
        let idx = self.cursor.get();
        let cached = self.renders.get(idx).ok_or_else(|| {
            FoamError::consistency(format!(
                "render cache holds {} images, image {} requested",
                self.renders.len(),
                idx
            ))
        })?;
        if cached.len() != rays.len() {
            return Err(FoamError::consistency(format!(
                "cached render {} has {} samples for {} rays",
                idx,
                cached.len(),
                rays.len()
            )));
        }
        self.cursor.set(idx + 1);
        Ok(cached.clone())
    }

    fn primal_density(&self) -> &[f32] {
        &self.scene.density
    }

    fn primal_attributes(&self) -> PrimalAttributes<'_> {
        PrimalAttributes {
            color_dc: &self.scene.color_dc,
            color_higher: &self.scene.color_higher,
            higher_dim: self.scene.higher_dim,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::{read_average_psnr, Evaluator};
    use crate::metrics::{composite_white, mean, psnr};

    fn split(width: u32, height: u32, count: usize) -> SplitData {
        let pixels = (width * height) as usize;
        let mut data = SplitData::default();
        for image in 0..count {
            data.rays.push(RayImage {
                width,
                height,
                rays: (0..pixels)
                    .map(|p| Ray::new(Vec3::splat(image as f32), Vec3::new(p as f32, 0.0, 1.0)))
                    .collect(),
            });
            data.rgbs.push(ColorImage {
                width,
                height,
                pixels: (0..pixels).map(|p| [p as f32 / 16.0, 0.5, 0.25]).collect(),
            });
        }
        data
    }

    fn scene() -> SceneRecord {
        SceneRecord {
            num_points: 2,
            higher_dim: 0,
            points: vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0],
            density: vec![1.0, 1.0],
            color_dc: vec![0.0; 6],
            color_higher: vec![],
            offsets: vec![0, 1, 2],
            neighbors: vec![1, 0],
        }
    }

    #[test]
    fn test_dataset_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let data = split(4, 3, 2);
        let mut dataset = ReplayDataset::new(dir.path());
        dataset.write_split(Split::Test, &data).unwrap();

        let loaded = dataset.reload(Split::Test, 1).unwrap();
        assert_eq!(loaded.rays, data.rays);
        assert_eq!(loaded.rgbs, data.rgbs);
    }

    #[test]
    fn test_dataset_downsample() {
        let dir = tempfile::tempdir().unwrap();
        let data = split(4, 3, 1);
        let mut dataset = ReplayDataset::new(dir.path());
        dataset.write_split(Split::Test, &data).unwrap();

        let loaded = dataset.reload(Split::Test, 2).unwrap();
        let image = &loaded.rays[0];
        assert_eq!((image.width, image.height), (2, 2));
        let kept: Vec<f32> = image.rays.iter().map(|r| r.direction.x).collect();
        assert_eq!(kept, vec![0.0, 2.0, 8.0, 10.0]);
        assert_eq!(loaded.rgbs[0].pixels[3], [10.0 / 16.0, 0.5, 0.25]);
    }

    #[test]
    fn test_dataset_missing_layout() {
        let dir = tempfile::tempdir().unwrap();
        let raw = b"ply\nformat binary_little_endian 1.0\nelement ray 0\nproperty float ox\nend_header\n";
        fs::write(dir.path().join("test_rays.ply"), raw).unwrap();
        let mut dataset = ReplayDataset::new(dir.path());
        assert!(matches!(
            dataset.reload(Split::Test, 1),
            Err(FoamError::Format(_))
        ));
    }

    fn write_header_only(dir: &Path, size: &str, count: &str) {
        let raw = format!(
            "ply\nformat binary_little_endian 1.0\ncomment image_size {}\ncomment image_count {}\nelement ray 0\nproperty float ox\nend_header\n",
            size, count
        );
        fs::write(dir.join("test_rays.ply"), raw).unwrap();
    }

    #[test]
    fn test_dataset_layout_overflow() {
        let dir = tempfile::tempdir().unwrap();
        let mut dataset = ReplayDataset::new(dir.path());

        write_header_only(dir.path(), "4294967296 4294967296", "1");
        assert!(matches!(
            dataset.reload(Split::Test, 1),
            Err(FoamError::Format(_))
        ));

        write_header_only(dir.path(), "4294967296 4294967295", "4294967297");
        assert!(matches!(
            dataset.reload(Split::Test, 1),
            Err(FoamError::Format(_))
        ));
    }

    #[test]
    fn test_dataset_degenerate_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut dataset = ReplayDataset::new(dir.path());

        write_header_only(dir.path(), "0 4", "1000000000000");
        assert!(matches!(
            dataset.reload(Split::Test, 1),
            Err(FoamError::Format(_))
        ));

        write_header_only(dir.path(), "100000000 100000000", "0");
        let loaded = dataset.reload(Split::Test, 1).unwrap();
        assert!(loaded.rays.is_empty());
        assert!(loaded.rgbs.is_empty());
    }

    #[test]
    fn test_replay_evaluation() {
        let dir = tempfile::tempdir().unwrap();
        let data = split(2, 2, 2);
        let renders = vec![vec![[0.25, 0.25, 0.25, 0.5]; 4], vec![[0.0, 0.5, 0.25, 1.0]; 4]];
        let cache = ReplayModel::render_cache_path(dir.path(), Split::Test);
        ReplayModel::write_cache(&cache, 2, 2, &renders).unwrap();

        let model = ReplayModel::load(scene(), &cache, 1).unwrap();
        let evaluator = Evaluator::new(dir.path());
        let report = evaluator.run(&model, &data).unwrap();

        let expected: Vec<f64> = renders
            .iter()
            .zip(&data.rgbs)
            .map(|(r, t)| psnr(&composite_white(r), &t.pixels))
            .collect();
        assert_eq!(report.per_image_psnr, expected);
        let average = read_average_psnr(evaluator.metrics_path()).unwrap();
        assert!((average - mean(&expected)).abs() < 1e-9);
    }

    #[test]
    fn test_replay_cache_exhausted() {
        let model = ReplayModel::new(scene(), vec![vec![[0.0; 4]; 2]]);
        let rays = vec![Ray::new(Vec3::ZERO, Vec3::Z); 2];
        assert!(model.render(&rays, 0).is_ok());
        assert!(matches!(
            model.render(&rays, 0),
            Err(FoamError::Consistency(_))
        ));
    }

    #[test]
    fn test_replay_cache_size_mismatch() {
        let model = ReplayModel::new(scene(), vec![vec![[0.0; 4]; 3]]);
        let rays = vec![Ray::new(Vec3::ZERO, Vec3::Z); 2];
        assert!(matches!(
            model.render(&rays, 0),
            Err(FoamError::Consistency(_))
        ));
    }
}

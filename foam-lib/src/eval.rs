//! Held-out evaluation: replays each test image's rays through a scene,
//! composites the result over white, scores it, and writes diagnostics.

use std::fs;
use std::path::{Path, PathBuf};

use glam::Vec3;
use image::ImageFormat;
use tracing::{debug, info};

use crate::common::SH_C0;
use crate::config::EvalConfig;
use crate::error::FoamError;
use crate::fetcher::{BatchFetcher, FetchMode};
use crate::metrics::{composite_white, diagnostic_strip, mean, psnr};
use crate::structures::{Ray, SceneRecord, SplitData, TraceData, DC_DIM};

/// Color attributes as held by a live model.
#[derive(Debug, Clone, Copy)]
pub struct PrimalAttributes<'a> {
    pub color_dc: &'a [f32],
    pub color_higher: &'a [f32],
    pub higher_dim: usize,
}

/// A scene that can be traversed by rays.
///
/// The traversal itself and the spatial index behind `starting_points`
/// belong to the implementor; the evaluator only relies on these contracts.
pub trait RenderableModel {
    fn trace_data(&self) -> TraceData<'_>;

    /// Resolves, for each image, the point its first ray starts in.
    fn starting_points(&self, origins: &[Vec3], points: &[f32]) -> Result<Vec<u32>, FoamError>;

    /// Returns accumulated radiance (rgb) and opacity (last channel) per ray.
    /// Must be fully computed when it returns.
    fn render(&self, rays: &[Ray], start_point: u32) -> Result<Vec<[f32; 4]>, FoamError>;

    fn primal_density(&self) -> &[f32];

    fn primal_attributes(&self) -> PrimalAttributes<'_>;
}

impl SceneRecord {
    /// Snapshots a live model into a record ready for [`crate::encode_scene`].
    pub fn from_model<M: RenderableModel + ?Sized>(model: &M) -> Result<Self, FoamError> {
        let trace = model.trace_data();
        let attributes = model.primal_attributes();
        let scene = SceneRecord {
            num_points: trace.points.len() / 3,
            higher_dim: attributes.higher_dim,
            points: trace.points.to_vec(),
            density: model.primal_density().to_vec(),
            color_dc: attributes.color_dc.to_vec(),
            color_higher: attributes.color_higher.to_vec(),
            offsets: trace.offsets.to_vec(),
            neighbors: trace.neighbors.to_vec(),
        };
        scene.validate()?;
        Ok(scene)
    }
}

#[derive(Debug, Clone)]
pub struct EvalReport {
    pub per_image_psnr: Vec<f64>,
    pub average_psnr: f64,
    pub image_paths: Vec<PathBuf>,
    pub metrics_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Evaluator {
    image_dir: PathBuf,
    metrics_path: PathBuf,
}

impl Evaluator {
    pub const DEFAULT_IMAGE_DIR: &'static str = "test_images";
    pub const DEFAULT_METRICS_FILE: &'static str = "metrics.txt";

    pub fn new(checkpoint: &Path) -> Self {
        Self {
            image_dir: checkpoint.join(Self::DEFAULT_IMAGE_DIR),
            metrics_path: checkpoint.join(Self::DEFAULT_METRICS_FILE),
        }
    }

    pub fn from_config(checkpoint: &Path, config: &EvalConfig) -> Self {
        Self {
            image_dir: checkpoint.join(&config.image_dir),
            metrics_path: checkpoint.join(&config.metrics_file),
        }
    }

    pub fn image_dir(&self) -> &Path {
        &self.image_dir
    }

    pub fn metrics_path(&self) -> &Path {
        &self.metrics_path
    }

    fn check_pairing(data: &SplitData) -> Result<(), FoamError> {
        if data.rays.is_empty() && data.rgbs.is_empty() {
            return Err(FoamError::consistency("the evaluation split has no images"));
        }
        if data.rays.len() != data.rgbs.len() {
            return Err(FoamError::consistency(format!(
                "{} ray batches but {} color batches",
                data.rays.len(),
                data.rgbs.len()
            )));
        }
        for (i, (rays, rgbs)) in data.rays.iter().zip(&data.rgbs).enumerate() {
            let pixels = (rays.width as usize) * (rays.height as usize);
            if (rays.width, rays.height) != (rgbs.width, rgbs.height)
                || rays.rays.len() != pixels
                || rgbs.pixels.len() != pixels
            {
                return Err(FoamError::consistency(format!(
                    "image {}: {} rays ({}x{}) do not pair with {} colors ({}x{})",
                    i,
                    rays.rays.len(),
                    rays.width,
                    rays.height,
                    rgbs.pixels.len(),
                    rgbs.width,
                    rgbs.height
                )));
            }
            if pixels == 0 {
                return Err(FoamError::consistency(format!("image {} has no pixels", i)));
            }
        }
        Ok(())
    }

    /// Renders every image of `data` through `model` and writes one diagnostic
    /// strip per image plus the average PSNR.
    ///
    /// Pairing is checked before anything touches the disk. A failure part
    /// way through leaves the strips of earlier images in place.
    #[tracing::instrument(skip_all, fields(images = data.rays.len()))]
    pub fn run<M: RenderableModel + ?Sized>(
        &self,
        model: &M,
        data: &SplitData,
    ) -> Result<EvalReport, FoamError> {
        Self::check_pairing(data)?;

        let mut ray_fetcher = BatchFetcher::new(&data.rays, 1, FetchMode::Sequential)?;
        let mut rgb_fetcher = BatchFetcher::new(&data.rgbs, 1, FetchMode::Sequential)?;

        let trace = model.trace_data();
        let origins: Vec<Vec3> = data.rays.iter().map(|img| img.rays[0].origin).collect();
        let start_points = model.starting_points(&origins, trace.points)?;
        if start_points.len() != origins.len() {
            return Err(FoamError::consistency(format!(
                "{} start points resolved for {} images",
                start_points.len(),
                origins.len()
            )));
        }

        fs::create_dir_all(&self.image_dir)?;

        let num_images = data.rays.len();
        let mut psnr_list = Vec::with_capacity(num_images);
        let mut image_paths = Vec::with_capacity(num_images);

        for (i, &start_point) in start_points.iter().enumerate() {
            let ray_batch = ray_fetcher.next();
            let rgb_batch = rgb_fetcher.next();

            for (rays, truth) in ray_batch.into_iter().zip(rgb_batch) {
                let output = model.render(&rays.rays, start_point)?;
                if output.len() != rays.rays.len() {
                    return Err(FoamError::consistency(format!(
                        "image {}: renderer returned {} samples for {} rays",
                        i,
                        output.len(),
                        rays.rays.len()
                    )));
                }

                let predicted = composite_white(&output);
                let img_psnr = psnr(&predicted, &truth.pixels);
                psnr_list.push(img_psnr);

                let strip = diagnostic_strip(truth.width, truth.height, &predicted, &truth.pixels)?;
                let path = self
                    .image_dir
                    .join(format!("rgb_{:03}_psnr_{:.3}.png", i, img_psnr));
                strip.save_with_format(&path, ImageFormat::Png)?;
                debug!("Image {}: PSNR {:.3} -> {}", i, img_psnr, path.display());
                image_paths.push(path);
            }
        }

        let average_psnr = mean(&psnr_list);
        fs::write(&self.metrics_path, format!("Average PSNR: {}", average_psnr))?;
        info!(
            "Evaluated {} images, average PSNR {:.3}, metrics written to {}",
            psnr_list.len(),
            average_psnr,
            self.metrics_path.display()
        );

        Ok(EvalReport {
            per_image_psnr: psnr_list,
            average_psnr,
            image_paths,
            metrics_path: self.metrics_path.clone(),
        })
    }
}

/// Reads the number back out of a metrics file written by [`Evaluator::run`].
pub fn read_average_psnr(path: &Path) -> Result<f64, FoamError> {
    let text = fs::read_to_string(path)?;
    text.rsplit(':')
        .next()
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| FoamError::format(format!("no PSNR value in {}", path.display())))
}

impl RenderableModel for SceneRecord {
    fn trace_data(&self) -> TraceData<'_> {
        TraceData::from(self)
    }

    fn starting_points(&self, origins: &[Vec3], points: &[f32]) -> Result<Vec<u32>, FoamError> {
        nearest_points(origins, points)
    }

    /// A bare record has no traversal backend: every ray sees only the base
    /// color of the start point, fully opaque. Useful for smoke tests.
    fn render(&self, rays: &[Ray], start_point: u32) -> Result<Vec<[f32; 4]>, FoamError> {
        let i = start_point as usize;
        if i >= self.num_points {
            return Err(FoamError::consistency(format!(
                "start point {} out of range for {} points",
                start_point, self.num_points
            )));
        }
        let dc = &self.color_dc[i * DC_DIM..(i + 1) * DC_DIM];
        let sample = [
            SH_C0 * dc[0] + 0.5,
            SH_C0 * dc[1] + 0.5,
            SH_C0 * dc[2] + 0.5,
            1.0,
        ];
        Ok(vec![sample; rays.len()])
    }

    fn primal_density(&self) -> &[f32] {
        &self.density
    }

    fn primal_attributes(&self) -> PrimalAttributes<'_> {
        PrimalAttributes {
            color_dc: &self.color_dc,
            color_higher: &self.color_higher,
            higher_dim: self.higher_dim,
        }
    }
}

/// Brute-force nearest point per origin. Linear in the number of points per
/// query, which is fine once per image.
pub fn nearest_points(origins: &[Vec3], points: &[f32]) -> Result<Vec<u32>, FoamError> {
    if points.len() < 3 {
        return Err(FoamError::consistency("cannot resolve start points in an empty scene"));
    }
    Ok(origins
        .iter()
        .map(|origin| {
            points
                .chunks_exact(3)
                .map(|p| Vec3::from_slice(p).distance_squared(*origin))
                .enumerate()
                .fold((0usize, f32::INFINITY), |best, (i, d)| {
                    if d < best.1 {
                        (i, d)
                    } else {
                        best
                    }
                })
                .0 as u32
        })
        .collect())
}

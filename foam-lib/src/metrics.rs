use image::RgbImage;

use crate::common::{clamp_u8, unit_to_u8, PSNR_SENTINEL};
use crate::error::FoamError;

/// Composites accumulated radiance over a white background.
///
/// The first three channels of each sample are radiance, the last is
/// accumulated opacity; whatever opacity is missing shows the background.
pub fn composite_white(output: &[[f32; 4]]) -> Vec<[f32; 3]> {
    output
        .iter()
        .map(|&[r, g, b, alpha]| {
            let background = 1.0 - alpha;
            [
                (r + background).clamp(0.0, 1.0),
                (g + background).clamp(0.0, 1.0),
                (b + background).clamp(0.0, 1.0),
            ]
        })
        .collect()
}

pub fn mse(predicted: &[[f32; 3]], truth: &[[f32; 3]]) -> f64 {
    let count = predicted.len() * 3;
    if count == 0 {
        return 0.0;
    }
    let sum: f64 = predicted
        .iter()
        .zip(truth)
        .flat_map(|(p, t)| p.iter().zip(t).map(|(&a, &b)| (a as f64 - b as f64).powi(2)))
        .sum();
    sum / count as f64
}

/// PSNR for signals in [0, 1]. A perfect match reports [`PSNR_SENTINEL`] instead of infinity.
pub fn psnr(predicted: &[[f32; 3]], truth: &[[f32; 3]]) -> f64 {
    let err = mse(predicted, truth);
    if err <= 0.0 {
        PSNR_SENTINEL
    } else {
        10.0 * (1.0 / err).log10()
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// 8-bit absolute difference, `round(|predicted - truth| * 255)` per channel.
pub fn error_map(predicted: &[[f32; 3]], truth: &[[f32; 3]]) -> Vec<[u8; 3]> {
    predicted
        .iter()
        .zip(truth)
        .map(|(p, t)| {
            [
                clamp_u8((p[0] - t[0]).abs() * 255.0),
                clamp_u8((p[1] - t[1]).abs() * 255.0),
                clamp_u8((p[2] - t[2]).abs() * 255.0),
            ]
        })
        .collect()
}

/// Lays out `[predicted | truth | error]` side by side as one RGB8 image of size `3w x h`.
pub fn diagnostic_strip(
    width: u32,
    height: u32,
    predicted: &[[f32; 3]],
    truth: &[[f32; 3]],
) -> Result<RgbImage, FoamError> {
    let expected_len = (width * height) as usize;
    if predicted.len() != expected_len || truth.len() != expected_len {
        return Err(FoamError::consistency(format!(
            "pixel buffers of length {} and {} do not match image size {}x{}",
            predicted.len(),
            truth.len(),
            width,
            height
        )));
    }

    let error = error_map(predicted, truth);
    let to_u8 = |px: &[f32; 3]| [unit_to_u8(px[0]), unit_to_u8(px[1]), unit_to_u8(px[2])];

    let mut encoded = Vec::with_capacity(expected_len * 9);
    for y in 0..height as usize {
        let row = y * width as usize..(y + 1) * width as usize;
        encoded.extend(predicted[row.clone()].iter().flat_map(to_u8));
        encoded.extend(truth[row.clone()].iter().flat_map(to_u8));
        encoded.extend(error[row].iter().flatten().copied());
    }

    RgbImage::from_raw(width * 3, height, encoded)
        .ok_or_else(|| FoamError::consistency("diagnostic strip buffer has the wrong size"))
}

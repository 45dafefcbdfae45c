pub mod common;
pub mod config;
pub mod device;
pub mod error;
pub mod eval;
pub mod fetcher;
pub mod metrics;
pub mod ply;
pub mod replay;
mod structures;

use common::is_zstd_frame;
use common::sh_dc_to_u8;
use common::ZSTD_MAX_COMPRESSION_LVL;
use error::FoamError;
use ply::put;
use ply::ElementDef;
use ply::PlyHeader;
use ply::ScalarKind;
use std::fs;
use std::io::{Cursor, Write};
use std::path::Path;
use tracing::{debug, info};
use zstd::stream::{decode_all, Encoder};

pub use structures::*;

/// Options for [`encode_scene_with`].
#[derive(Debug, Default, Clone, Copy)]
pub struct EncodeOptions {
    /// Also write 8-bit `red`/`green`/`blue` derived from the base color, for viewers
    /// that only understand plain colored point clouds. Ignored by [`decode_scene`].
    pub preview_colors: bool,
}

fn color_name(i: usize) -> String {
    format!("{}{}", COLOR_PREFIX, i)
}

fn scene_header(scene: &SceneRecord, options: &EncodeOptions) -> PlyHeader {
    let mut vertex = ElementDef::new(VERTEX_ELEMENT, scene.num_points)
        .with_property("x", ScalarKind::Float)
        .with_property("y", ScalarKind::Float)
        .with_property("z", ScalarKind::Float);
    if options.preview_colors {
        vertex = vertex
            .with_property("red", ScalarKind::UChar)
            .with_property("green", ScalarKind::UChar)
            .with_property("blue", ScalarKind::UChar);
    }
    vertex = vertex
        .with_property(DENSITY_PROPERTY, ScalarKind::Float)
        .with_property(OFFSET_PROPERTY, ScalarKind::UInt);
    for i in 0..(DC_DIM + scene.higher_dim) {
        vertex = vertex.with_property(color_name(i), ScalarKind::Float);
    }

    let adjacency = ElementDef::new(ADJACENCY_ELEMENT, scene.num_edges())
        .with_property(ADJACENCY_PROPERTY, ScalarKind::UInt);

    PlyHeader {
        comments: Vec::new(),
        elements: vec![vertex, adjacency],
    }
}

pub fn encode_scene(scene: &SceneRecord, output: &mut Vec<u8>) -> Result<(), FoamError> {
    encode_scene_with(scene, &EncodeOptions::default(), output)
}

/// Writes `scene` as a binary PLY with a `vertex` table and a flat `adjacency` list.
///
/// Each vertex stores the running neighbor count *after* its own edges
/// (`offsets[i + 1]`); the leading zero of `offsets` is implied.
#[tracing::instrument(skip_all, fields(points = scene.num_points, edges = scene.num_edges()))]
pub fn encode_scene_with(
    scene: &SceneRecord,
    options: &EncodeOptions,
    output: &mut Vec<u8>,
) -> Result<(), FoamError> {
    scene.validate()?;

    let header = scene_header(scene, options);
    let num_points = scene.num_points;
    let k = scene.higher_dim;

    output.clear();
    header.write(output)?;

    let row_size = header.elements[0].row_size();
    output.reserve(num_points * row_size + scene.num_edges() * 4);

    for i in 0..num_points {
        put(output, &scene.points[i * 3..i * 3 + 3]);
        let dc = &scene.color_dc[i * DC_DIM..(i + 1) * DC_DIM];
        if options.preview_colors {
            output.extend(dc.iter().map(|&c| sh_dc_to_u8(c)));
        }
        put(output, &scene.density[i..i + 1]);
        put(output, &scene.offsets[i + 1..i + 2]);
        put(output, dc);
        put(output, &scene.color_higher[i * k..(i + 1) * k]);
    }

    put(output, &scene.neighbors);
    debug!("Encoded scene into {} bytes", output.len());
    Ok(())
}

/// Collects the indices of the `color_sh_*` columns, which must be numbered 0..M without gaps.
fn color_columns<'a>(names: impl Iterator<Item = &'a str>) -> Result<usize, FoamError> {
    let mut indices = Vec::new();
    for name in names {
        if let Some(suffix) = name.strip_prefix(COLOR_PREFIX) {
            let idx: usize = suffix.parse().map_err(|e| {
                FoamError::format(format!("Bad color column name '{}': {}", name, e))
            })?;
            indices.push(idx);
        }
    }
    indices.sort_unstable();
    if let Some(pos) = indices.iter().enumerate().position(|(i, &idx)| i != idx) {
        return Err(FoamError::format(format!(
            "Color columns are not contiguous: expected {}{}",
            COLOR_PREFIX, pos
        )));
    }
    if indices.len() < DC_DIM {
        return Err(FoamError::format(format!(
            "Expected at least {} color columns, found {}",
            DC_DIM,
            indices.len()
        )));
    }
    Ok(indices.len())
}

#[tracing::instrument(skip_all, fields(bytes = raw_data.len()))]
pub fn decode_scene(raw_data: &[u8]) -> Result<SceneRecord, FoamError> {
    let (header, offset) = ply::parse_header(raw_data)?;
    let views = ply::split_body(&header, &raw_data[offset..])?;

    let vertex = views
        .get(VERTEX_ELEMENT)
        .ok_or_else(|| FoamError::format("Missing 'vertex' element"))?;
    let adjacency = views
        .get(ADJACENCY_ELEMENT)
        .ok_or_else(|| FoamError::format("Missing 'adjacency' element"))?;

    let num_points = vertex.len();
    let num_colors = color_columns(vertex.property_names())?;
    let higher_dim = num_colors - DC_DIM;

    let points = vertex.interleaved_f32(&["x", "y", "z"])?;
    let density = vertex.column_f32(DENSITY_PROPERTY)?;
    let cumulative = vertex.column_u32(OFFSET_PROPERTY)?;

    let dc_names: Vec<String> = (0..DC_DIM).map(color_name).collect();
    let dc_refs: Vec<&str> = dc_names.iter().map(String::as_str).collect();
    let color_dc = vertex.interleaved_f32(&dc_refs)?;

    let higher_names: Vec<String> = (DC_DIM..num_colors).map(color_name).collect();
    let higher_refs: Vec<&str> = higher_names.iter().map(String::as_str).collect();
    let color_higher = vertex.interleaved_f32(&higher_refs)?;

    let neighbors = adjacency.column_u32(ADJACENCY_PROPERTY)?;

    let total = cumulative.last().copied().unwrap_or(0) as usize;
    if neighbors.len() != total {
        return Err(FoamError::format(format!(
            "Adjacency list has {} entries but the last cumulative count is {}",
            neighbors.len(),
            total
        )));
    }

    let mut offsets = Vec::with_capacity(num_points + 1);
    offsets.push(0);
    offsets.extend_from_slice(&cumulative);

    let scene = SceneRecord {
        num_points,
        higher_dim,
        points,
        density,
        color_dc,
        color_higher,
        offsets,
        neighbors,
    };
    scene.check_graph()?;

    debug!(
        "Decoded scene: {} points, {} edges, {} higher color coefficients",
        scene.num_points,
        scene.num_edges(),
        higher_dim
    );
    Ok(scene)
}

pub fn save_scene(path: &Path, scene: &SceneRecord) -> Result<(), FoamError> {
    let mut buf = Vec::new();
    encode_scene(scene, &mut buf)?;
    fs::write(path, &buf)?;
    info!("Saved {} points to {}", scene.num_points, path.display());
    Ok(())
}

/// Loads a scene from disk, transparently unpacking zstd-compressed files.
pub fn load_scene(path: &Path) -> Result<SceneRecord, FoamError> {
    let raw_data = fs::read(path)?;
    info!("Loading {} ({} bytes)", path.display(), raw_data.len());
    if is_zstd_frame(&raw_data) {
        let uncompressed = decompress_zstd(&raw_data)?;
        decode_scene(&uncompressed)
    } else {
        decode_scene(&raw_data)
    }
}

fn compress_error(stage: &str, e: std::io::Error) -> FoamError {
    FoamError::Compress(format!("{} failed: {}", stage, e))
}

fn decompress_error(e: std::io::Error) -> FoamError {
    FoamError::Decompress(format!("Decompression failed: {}", e))
}

/// Checks that `raw_data` is a valid scene and returns the zstd level to pack it at.
fn pack_level(raw_data: &[u8], compression_level: u32) -> Result<i32, FoamError> {
    let scene = decode_scene(raw_data)?;
    debug!("Packing {} points, {} edges", scene.num_points, scene.num_edges());
    Ok(compression_level.min(ZSTD_MAX_COMPRESSION_LVL) as i32)
}

/// Hands unpacked bytes to the caller only once they decode as a scene.
fn accept_unpacked(uncompressed: Vec<u8>, output: &mut Vec<u8>) -> Result<(), FoamError> {
    decode_scene(&uncompressed)?;
    *output = uncompressed;
    Ok(())
}

#[inline(never)]
fn compress_zstd(data: &[u8], level: i32, workers: u32) -> Result<Vec<u8>, FoamError> {
    let mut encoder =
        Encoder::new(Vec::new(), level).map_err(|e| compress_error("Encoder creation", e))?;
    encoder
        .multithread(workers)
        .map_err(|e| compress_error("Setting multithread", e))?;
    encoder
        .write_all(data)
        .map_err(|e| compress_error("Writing data", e))?;
    encoder.finish().map_err(|e| compress_error("Finalizing compression", e))
}

#[inline(never)]
fn decompress_zstd(data: &[u8]) -> Result<Vec<u8>, FoamError> {
    decode_all(Cursor::new(data)).map_err(decompress_error)
}

/// Validates a scene PLY and compresses it with zstd.
pub fn pack(
    raw_data: &[u8],
    compression_level: u32,
    workers: u32,
    output: &mut Vec<u8>,
) -> Result<(), FoamError> {
    let level = pack_level(raw_data, compression_level)?;
    *output = compress_zstd(raw_data, level, workers)?;
    Ok(())
}

/// Decompresses a packed scene and checks that it decodes before handing back the PLY bytes.
pub fn unpack(packed: &[u8], output: &mut Vec<u8>) -> Result<(), FoamError> {
    accept_unpacked(decompress_zstd(packed)?, output)
}

cfg_if::cfg_if! {
if #[cfg(feature = "async")] {
    use async_compression::tokio::bufread::ZstdDecoder;
    use async_compression::tokio::write::ZstdEncoder;
    use async_compression::zstd::CParameter;
    use async_compression::Level;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Same as [`pack`], with the compression stream driven by tokio.
    pub async fn pack_async(
        raw_data: &[u8],
        compression_level: u32,
        workers: u32,
        output: &mut Vec<u8>,
    ) -> Result<(), FoamError> {
        let level = pack_level(raw_data, compression_level)?;
        let mut encoder = ZstdEncoder::with_quality_and_params(
            Vec::new(),
            Level::Precise(level),
            &[CParameter::nb_workers(workers)],
        );
        encoder
            .write_all(raw_data)
            .await
            .map_err(|e| compress_error("Writing data", e))?;
        encoder
            .shutdown()
            .await
            .map_err(|e| compress_error("Finalizing compression", e))?;
        *output = encoder.into_inner();
        Ok(())
    }

    pub async fn unpack_async(packed: &[u8], output: &mut Vec<u8>) -> Result<(), FoamError> {
        let mut decoder = ZstdDecoder::new(packed);
        let mut uncompressed = Vec::new();
        decoder
            .read_to_end(&mut uncompressed)
            .await
            .map_err(decompress_error)?;
        accept_unpacked(uncompressed, output)
    }
}
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Builds a scene with a random CSR graph whose neighbor lists never point at themselves.
    fn random_scene(rng: &mut StdRng, num_points: usize, higher_dim: usize) -> SceneRecord {
        let mut offsets = vec![0u32];
        let mut neighbors = Vec::new();
        for i in 0..num_points {
            let degree = if num_points > 1 { rng.gen_range(0..6) } else { 0 };
            for _ in 0..degree {
                let mut j = rng.gen_range(0..num_points);
                if j == i {
                    j = (j + 1) % num_points;
                }
                neighbors.push(j as u32);
            }
            offsets.push(neighbors.len() as u32);
        }
        let mut floats = |len: usize| -> Vec<f32> {
            (0..len).map(|_| rng.gen_range(-10.0f32..10.0)).collect()
        };
        SceneRecord {
            num_points,
            higher_dim,
            points: floats(num_points * 3),
            density: floats(num_points),
            color_dc: floats(num_points * DC_DIM),
            color_higher: floats(num_points * higher_dim),
            offsets,
            neighbors,
        }
    }

    fn bits(values: &[f32]) -> Vec<u32> {
        values.iter().map(|v| v.to_bits()).collect()
    }

    fn assert_bit_identical(a: &SceneRecord, b: &SceneRecord) {
        assert_eq!(a.num_points, b.num_points);
        assert_eq!(a.higher_dim, b.higher_dim);
        assert_eq!(bits(&a.points), bits(&b.points));
        assert_eq!(bits(&a.density), bits(&b.density));
        assert_eq!(bits(&a.color_dc), bits(&b.color_dc));
        assert_eq!(bits(&a.color_higher), bits(&b.color_higher));
        assert_eq!(a.offsets, b.offsets);
        assert_eq!(a.neighbors, b.neighbors);
    }

    fn encoded(scene: &SceneRecord) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_scene(scene, &mut buf).expect("encode_scene failed");
        buf
    }

    #[test]
    fn test_roundtrip_random_scenes() {
        let mut rng = StdRng::seed_from_u64(7);
        for &(n, k) in &[(1, 0), (5, 3), (64, 9), (300, 45)] {
            let scene = random_scene(&mut rng, n, k);
            let decoded = decode_scene(&encoded(&scene)).expect("decode_scene failed");
            assert_bit_identical(&scene, &decoded);
        }
    }

    #[test]
    fn test_roundtrip_preserves_special_floats() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut scene = random_scene(&mut rng, 4, 2);
        scene.density[0] = f32::NAN;
        scene.density[1] = -0.0;
        scene.points[2] = f32::MIN_POSITIVE / 2.0;
        scene.color_higher[3] = f32::INFINITY;
        let decoded = decode_scene(&encoded(&scene)).unwrap();
        assert_bit_identical(&scene, &decoded);
    }

    #[test]
    fn test_roundtrip_empty_scene() {
        let scene = SceneRecord {
            higher_dim: 6,
            offsets: vec![0],
            ..Default::default()
        };
        let decoded = decode_scene(&encoded(&scene)).unwrap();
        assert_eq!(decoded, scene);
    }

    #[test]
    fn test_decoded_graph_is_csr() {
        let mut rng = StdRng::seed_from_u64(3);
        let scene = random_scene(&mut rng, 120, 0);
        let decoded = decode_scene(&encoded(&scene)).unwrap();
        assert_eq!(decoded.offsets[0], 0);
        assert!(decoded.offsets.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(
            *decoded.offsets.last().unwrap() as usize,
            decoded.neighbors.len()
        );
        assert!(decoded
            .neighbors
            .iter()
            .all(|&v| (v as usize) < decoded.num_points));
    }

    #[test]
    fn test_stores_cumulative_counts() {
        let scene = SceneRecord {
            num_points: 2,
            higher_dim: 0,
            points: vec![0.0; 6],
            density: vec![1.0, 2.0],
            color_dc: vec![0.0; 6],
            color_higher: vec![],
            offsets: vec![0, 1, 2],
            neighbors: vec![1, 0],
        };
        let raw = encoded(&scene);
        let (header, offset) = ply::parse_header(&raw).unwrap();
        let views = ply::split_body(&header, &raw[offset..]).unwrap();
        assert_eq!(
            views[VERTEX_ELEMENT].column_u32(OFFSET_PROPERTY).unwrap(),
            vec![1, 2]
        );
    }

    #[test]
    fn test_encode_rejects_bad_shapes() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut scene = random_scene(&mut rng, 10, 3);
        scene.color_higher.pop();
        let mut buf = Vec::new();
        assert!(matches!(
            encode_scene(&scene, &mut buf),
            Err(FoamError::Consistency(_))
        ));

        let mut scene = random_scene(&mut rng, 10, 3);
        scene.offsets.pop();
        assert!(matches!(
            encode_scene(&scene, &mut buf),
            Err(FoamError::Consistency(_))
        ));
    }

    #[test]
    fn test_encode_rejects_invalid_graph() {
        let mut scene = SceneRecord {
            num_points: 2,
            higher_dim: 0,
            points: vec![0.0; 6],
            density: vec![1.0; 2],
            color_dc: vec![0.0; 6],
            color_higher: vec![],
            offsets: vec![2, 2, 2],
            neighbors: vec![1, 0],
        };
        let mut buf = Vec::new();
        assert!(matches!(
            encode_scene(&scene, &mut buf),
            Err(FoamError::Consistency(_))
        ));

        scene.offsets = vec![0, 1, 2];
        scene.neighbors = vec![1, 7];
        assert!(matches!(
            encode_scene(&scene, &mut buf),
            Err(FoamError::Consistency(_))
        ));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scene.ply");
        assert!(save_scene(&path, &scene).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_preview_colors_do_not_change_values() {
        let mut rng = StdRng::seed_from_u64(5);
        let scene = random_scene(&mut rng, 20, 3);
        let mut buf = Vec::new();
        encode_scene_with(
            &scene,
            &EncodeOptions {
                preview_colors: true,
            },
            &mut buf,
        )
        .unwrap();

        let (header, offset) = ply::parse_header(&buf).unwrap();
        let views = ply::split_body(&header, &buf[offset..]).unwrap();
        let red = views[VERTEX_ELEMENT].column_u8("red").unwrap();
        assert_eq!(red[0], sh_dc_to_u8(scene.color_dc[0]));

        let decoded = decode_scene(&buf).unwrap();
        assert_bit_identical(&scene, &decoded);
    }

    #[test]
    fn test_truncated_sections() {
        let mut rng = StdRng::seed_from_u64(6);
        let scene = random_scene(&mut rng, 16, 0);
        let raw = encoded(&scene);

        // Cut inside the adjacency list.
        let short = &raw[..raw.len() - 3];
        assert!(matches!(decode_scene(short), Err(FoamError::Format(_))));

        // Cut inside the vertex table.
        let (_, offset) = ply::parse_header(&raw).unwrap();
        let short = &raw[..offset + 10];
        assert!(matches!(decode_scene(short), Err(FoamError::Format(_))));
    }

    #[test]
    fn test_missing_adjacency_element() {
        let data = b"ply\nformat binary_little_endian 1.0\nelement vertex 0\nproperty float x\nend_header\n";
        assert!(matches!(decode_scene(data), Err(FoamError::Format(_))));
    }

    fn raw_scene(cumulative: &[u32], adjacency: &[u32], colors: usize) -> Vec<u8> {
        let mut vertex = ElementDef::new(VERTEX_ELEMENT, cumulative.len())
            .with_property("x", ScalarKind::Float)
            .with_property("y", ScalarKind::Float)
            .with_property("z", ScalarKind::Float)
            .with_property(DENSITY_PROPERTY, ScalarKind::Float)
            .with_property(OFFSET_PROPERTY, ScalarKind::UInt);
        for i in 0..colors {
            vertex = vertex.with_property(color_name(i), ScalarKind::Float);
        }
        let header = PlyHeader {
            comments: vec![],
            elements: vec![
                vertex,
                ElementDef::new(ADJACENCY_ELEMENT, adjacency.len())
                    .with_property(ADJACENCY_PROPERTY, ScalarKind::UInt),
            ],
        };
        let mut out = Vec::new();
        header.write(&mut out).unwrap();
        for &c in cumulative {
            put(&mut out, &[0.0f32; 4]);
            put(&mut out, &[c]);
            put(&mut out, &vec![0.0f32; colors]);
        }
        put(&mut out, adjacency);
        out
    }

    #[test]
    fn test_adjacency_length_mismatch() {
        let raw = raw_scene(&[1, 3], &[1, 0], 3);
        assert!(matches!(decode_scene(&raw), Err(FoamError::Format(_))));
    }

    #[test]
    fn test_missing_color_columns() {
        let raw = raw_scene(&[1, 2], &[1, 0], 0);
        assert!(matches!(decode_scene(&raw), Err(FoamError::Format(_))));
        let raw = raw_scene(&[1, 2], &[1, 0], 2);
        assert!(matches!(decode_scene(&raw), Err(FoamError::Format(_))));
    }

    #[test]
    fn test_neighbor_out_of_range_is_inconsistent() {
        let raw = raw_scene(&[1, 2], &[1, 2], 3);
        assert!(matches!(
            decode_scene(&raw),
            Err(FoamError::Consistency(_))
        ));
    }

    #[test]
    fn test_non_contiguous_color_columns() {
        let header = b"ply\nformat binary_little_endian 1.0\nelement vertex 0\nproperty float x\nproperty float y\nproperty float z\nproperty float density\nproperty uint adjacency_offset\nproperty float color_sh_0\nproperty float color_sh_1\nproperty float color_sh_3\nelement adjacency 0\nproperty uint adjacency\nend_header\n";
        assert!(matches!(decode_scene(header), Err(FoamError::Format(_))));
    }

    #[test]
    fn test_pack_unpack() {
        let mut rng = StdRng::seed_from_u64(8);
        let scene = random_scene(&mut rng, 50, 9);
        let raw = encoded(&scene);

        let mut packed = Vec::new();
        pack(&raw, 3, 1, &mut packed).expect("pack(...) failed");
        assert!(is_zstd_frame(&packed));

        let mut unpacked = Vec::new();
        unpack(&packed, &mut unpacked).expect("unpack(...) failed");
        assert_eq!(unpacked, raw);
    }

    #[test]
    fn test_pack_rejects_invalid_scene() {
        let mut out = Vec::new();
        assert!(matches!(
            pack(b"not a ply", 3, 1, &mut out),
            Err(FoamError::Format(_))
        ));
        assert!(matches!(
            unpack(b"not zstd either", &mut out),
            Err(FoamError::Decompress(_))
        ));
    }

    #[test]
    fn test_unpack_rejects_packed_non_scene() {
        let packed = compress_zstd(b"ply\nformat ascii 1.0\n", 3, 1).unwrap();
        let mut out = vec![1, 2, 3];
        assert!(matches!(
            unpack(&packed, &mut out),
            Err(FoamError::Format(_))
        ));
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[test]
    fn test_save_and_load_packed() {
        let mut rng = StdRng::seed_from_u64(9);
        let scene = random_scene(&mut rng, 30, 3);
        let dir = tempfile::tempdir().unwrap();

        let plain = dir.path().join("scene.ply");
        save_scene(&plain, &scene).unwrap();
        assert_bit_identical(&scene, &load_scene(&plain).unwrap());

        let mut packed = Vec::new();
        pack(&fs::read(&plain).unwrap(), 3, 1, &mut packed).unwrap();
        let packed_path = dir.path().join("scene.ply.zst");
        fs::write(&packed_path, &packed).unwrap();
        assert_bit_identical(&scene, &load_scene(&packed_path).unwrap());
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn test_pack_unpack_async() {
        let mut rng = StdRng::seed_from_u64(10);
        let scene = random_scene(&mut rng, 40, 3);
        let raw = encoded(&scene);

        let mut packed = Vec::new();
        pack_async(&raw, 1, 1, &mut packed)
            .await
            .expect("pack_async failed");

        let mut unpacked = Vec::new();
        unpack_async(&packed, &mut unpacked)
            .await
            .expect("unpack_async failed");
        assert_eq!(unpacked, raw);
    }
}

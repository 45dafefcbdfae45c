pub const ZSTD_MAX_COMPRESSION_LVL: u32 = 22;

/// Zeroth-order spherical harmonic basis constant.
pub const SH_C0: f32 = 0.282_094_8;

/// Reported instead of infinity when a rendered image matches its ground truth exactly.
pub const PSNR_SENTINEL: f64 = 100.0;

pub(crate) const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

#[inline]
pub(crate) fn clamp_u8(x: f32) -> u8 {
    x.round().clamp(0.0, 255.0) as u8
}

#[inline]
pub(crate) fn unit_to_u8(x: f32) -> u8 {
    clamp_u8(x.clamp(0.0, 1.0) * 255.0)
}

#[inline]
pub(crate) fn sh_dc_to_u8(dc: f32) -> u8 {
    unit_to_u8(dc * SH_C0 + 0.5)
}

#[inline]
pub(crate) fn is_zstd_frame(data: &[u8]) -> bool {
    data.len() >= ZSTD_MAGIC.len() && data[..ZSTD_MAGIC.len()] == ZSTD_MAGIC
}

#[inline]
pub(crate) fn next_line<'b>(buffer: &'b [u8], offset: &mut usize) -> Option<&'b [u8]> {
    if *offset >= buffer.len() {
        return None;
    }
    let start = *offset;

    match memchr::memchr(b'\n', &buffer[*offset..]) {
        Some(pos) => {
            *offset = start + pos + 1;
            let line = &buffer[start..start + pos];
            // Tolerate CRLF headers written on Windows.
            Some(line.strip_suffix(b"\r").unwrap_or(line))
        }
        None => {
            *offset = buffer.len();
            Some(&buffer[start..])
        }
    }
}

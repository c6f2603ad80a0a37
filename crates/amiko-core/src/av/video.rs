//! YV12 plane packing.
//!
//! Capture and render layers hand video around as one contiguous YV12
//! buffer with stride-aligned rows (Y plane, then V, then U). Encoders want
//! separate tightly-packed planes. These conversions are pure functions
//! over sized byte slices with explicit stride parameters; no call state is
//! involved.

use crate::error::{Error, Result};

/// Row alignment used by the default capture path.
pub const DEFAULT_PLANE_ALIGNMENT: usize = 16;

/// Round `width` up to the next multiple of `alignment`.
pub fn aligned_stride(width: usize, alignment: usize) -> usize {
    debug_assert!(alignment > 0);
    width.div_ceil(alignment) * alignment
}

/// Total size of a strided YV12 buffer.
pub fn yv12_frame_size(height: usize, y_stride: usize, c_stride: usize) -> usize {
    y_stride * height + 2 * (c_stride * (height / 2))
}

fn check_geometry(width: usize, height: usize, y_stride: usize, c_stride: usize) -> Result<()> {
    if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
        return Err(Error::BadGeometry);
    }
    if y_stride < width || c_stride < width / 2 {
        return Err(Error::BadGeometry);
    }
    Ok(())
}

/// Pack tight Y, U and V planes into one strided YV12 buffer.
///
/// `y` must hold `width * height` bytes; `u` and `v` hold
/// `(width / 2) * (height / 2)` bytes each. Row padding in the output is
/// zeroed. Plane order in the output is Y, V, U.
pub fn pack_yv12(
    y: &[u8],
    u: &[u8],
    v: &[u8],
    width: usize,
    height: usize,
    y_stride: usize,
    c_stride: usize,
) -> Result<Vec<u8>> {
    check_geometry(width, height, y_stride, c_stride)?;

    let c_width = width / 2;
    let c_height = height / 2;
    if y.len() != width * height || u.len() != c_width * c_height || v.len() != c_width * c_height {
        return Err(Error::BadGeometry);
    }

    let mut out = vec![0u8; yv12_frame_size(height, y_stride, c_stride)];
    let v_offset = y_stride * height;
    let u_offset = v_offset + c_stride * c_height;

    for row in 0..height {
        out[row * y_stride..row * y_stride + width]
            .copy_from_slice(&y[row * width..(row + 1) * width]);
    }
    for row in 0..c_height {
        out[v_offset + row * c_stride..v_offset + row * c_stride + c_width]
            .copy_from_slice(&v[row * c_width..(row + 1) * c_width]);
        out[u_offset + row * c_stride..u_offset + row * c_stride + c_width]
            .copy_from_slice(&u[row * c_width..(row + 1) * c_width]);
    }

    Ok(out)
}

/// Split a strided YV12 buffer back into tight Y, U and V planes.
pub fn unpack_yv12(
    buffer: &[u8],
    width: usize,
    height: usize,
    y_stride: usize,
    c_stride: usize,
) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>)> {
    check_geometry(width, height, y_stride, c_stride)?;
    if buffer.len() < yv12_frame_size(height, y_stride, c_stride) {
        return Err(Error::BadGeometry);
    }

    let c_width = width / 2;
    let c_height = height / 2;
    let v_offset = y_stride * height;
    let u_offset = v_offset + c_stride * c_height;

    let mut y = Vec::with_capacity(width * height);
    let mut u = Vec::with_capacity(c_width * c_height);
    let mut v = Vec::with_capacity(c_width * c_height);

    for row in 0..height {
        y.extend_from_slice(&buffer[row * y_stride..row * y_stride + width]);
    }
    for row in 0..c_height {
        v.extend_from_slice(&buffer[v_offset + row * c_stride..v_offset + row * c_stride + c_width]);
        u.extend_from_slice(&buffer[u_offset + row * c_stride..u_offset + row * c_stride + c_width]);
    }

    Ok((y, u, v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_stride() {
        assert_eq!(aligned_stride(16, 16), 16);
        assert_eq!(aligned_stride(17, 16), 32);
        assert_eq!(aligned_stride(640, 16), 640);
        assert_eq!(aligned_stride(1, 16), 16);
    }

    #[test]
    fn test_stride_equal_to_width_is_concatenation() {
        let width = 4;
        let height = 2;
        let y: Vec<u8> = (0..8).collect();
        let u = vec![100, 101];
        let v = vec![200, 201];

        let packed = pack_yv12(&y, &u, &v, width, height, width, width / 2).expect("pack");

        // Y, then V, then U, no padding anywhere.
        let mut expected = y.clone();
        expected.extend_from_slice(&v);
        expected.extend_from_slice(&u);
        assert_eq!(packed, expected);
    }

    #[test]
    fn test_pack_unpack_roundtrip_with_alignment() {
        let width = 6;
        let height = 4;
        let y_stride = aligned_stride(width, DEFAULT_PLANE_ALIGNMENT);
        let c_stride = aligned_stride(width / 2, DEFAULT_PLANE_ALIGNMENT);

        let y: Vec<u8> = (0..(width * height) as u8).collect();
        let u: Vec<u8> = (0..((width / 2) * (height / 2)) as u8).map(|b| b + 50).collect();
        let v: Vec<u8> = (0..((width / 2) * (height / 2)) as u8).map(|b| b + 150).collect();

        let packed = pack_yv12(&y, &u, &v, width, height, y_stride, c_stride).expect("pack");
        assert_eq!(packed.len(), yv12_frame_size(height, y_stride, c_stride));

        let (y2, u2, v2) = unpack_yv12(&packed, width, height, y_stride, c_stride).expect("unpack");
        assert_eq!(y, y2);
        assert_eq!(u, u2);
        assert_eq!(v, v2);
    }

    #[test]
    fn test_bad_geometry_rejected() {
        let y = vec![0u8; 16];
        let c = vec![0u8; 4];

        // Odd dimensions.
        assert_eq!(
            pack_yv12(&y, &c, &c, 3, 4, 16, 8).unwrap_err(),
            Error::BadGeometry
        );
        // Stride narrower than the row.
        assert_eq!(
            pack_yv12(&y, &c, &c, 4, 4, 2, 8).unwrap_err(),
            Error::BadGeometry
        );
        // Plane too short.
        assert_eq!(
            pack_yv12(&y[..8], &c, &c, 4, 4, 4, 2).unwrap_err(),
            Error::BadGeometry
        );
        // Truncated buffer on unpack.
        assert_eq!(
            unpack_yv12(&y, 4, 4, 4, 2).unwrap_err(),
            Error::BadGeometry
        );
    }
}

//! Stride-aware plane copies from decoder output into pool slots.
//!
//! Decoder rows usually carry codec padding, so `src_stride` and `dst_stride`
//! rarely match. Only `width` bytes of each source row are read, ever. On
//! 128-bit SIMD targets the inner loop moves 32 bytes per step (two 16-byte
//! loads and stores) with a read prefetch 8 rows ahead; everywhere else a
//! plain row copy is used.

/// Rows of lookahead for the SIMD prefetch.
#[allow(dead_code)]
const PREFETCH_ROWS: usize = 8;

/// Bytes moved per SIMD inner step.
#[allow(dead_code)]
const SIMD_CHUNK: usize = 32;

/// Copy `height` rows of `width` valid bytes from `src` (rows `src_stride`
/// apart) to `dst` (rows `dst_stride` apart).
///
/// # Panics
///
/// Panics if either buffer is too small for the requested geometry or a
/// stride is narrower than `width`.
pub fn copy_plane(
    dst: &mut [u8],
    dst_stride: usize,
    src: &[u8],
    src_stride: usize,
    width: usize,
    height: usize,
) {
    if width == 0 || height == 0 {
        return;
    }
    assert!(src_stride >= width && dst_stride >= width);
    assert!(src.len() >= (height - 1) * src_stride + width);
    assert!(dst.len() >= (height - 1) * dst_stride + width);

    #[cfg(target_arch = "aarch64")]
    unsafe {
        copy_plane_neon(
            dst.as_mut_ptr(),
            dst_stride,
            src.as_ptr(),
            src_stride,
            width,
            height,
        );
        return;
    }

    #[cfg(target_arch = "x86_64")]
    unsafe {
        copy_plane_sse2(
            dst.as_mut_ptr(),
            dst_stride,
            src.as_ptr(),
            src_stride,
            width,
            height,
        );
        return;
    }

    #[allow(unreachable_code)]
    copy_plane_scalar(dst, dst_stride, src, src_stride, width, height);
}

fn copy_plane_scalar(
    dst: &mut [u8],
    dst_stride: usize,
    src: &[u8],
    src_stride: usize,
    width: usize,
    height: usize,
) {
    for row in 0..height {
        let s = &src[row * src_stride..row * src_stride + width];
        let d = &mut dst[row * dst_stride..row * dst_stride + width];
        d.copy_from_slice(s);
    }
}

/// NEON row copy: 32 bytes per step, tail handled bytewise.
///
/// # Safety
///
/// Caller has validated that both buffers cover `height` rows of `width`
/// bytes at the given strides.
#[cfg(target_arch = "aarch64")]
unsafe fn copy_plane_neon(
    dst: *mut u8,
    dst_stride: usize,
    src: *const u8,
    src_stride: usize,
    width: usize,
    height: usize,
) {
    use std::arch::aarch64::{vld1q_u8, vst1q_u8};

    for row in 0..height {
        let mut s = src.add(row * src_stride);
        let mut d = dst.add(row * dst_stride);

        if row + PREFETCH_ROWS < height {
            let ahead = src.add((row + PREFETCH_ROWS) * src_stride);
            std::arch::asm!("prfm pldl1strm, [{0}]", in(reg) ahead, options(nostack, readonly));
        }

        let mut remaining = width;
        while remaining >= SIMD_CHUNK {
            let lo = vld1q_u8(s);
            let hi = vld1q_u8(s.add(16));
            vst1q_u8(d, lo);
            vst1q_u8(d.add(16), hi);
            s = s.add(SIMD_CHUNK);
            d = d.add(SIMD_CHUNK);
            remaining -= SIMD_CHUNK;
        }
        std::ptr::copy_nonoverlapping(s, d, remaining);
    }
}

/// SSE2 row copy, same shape as the NEON path.
///
/// # Safety
///
/// Caller has validated that both buffers cover `height` rows of `width`
/// bytes at the given strides.
#[cfg(target_arch = "x86_64")]
unsafe fn copy_plane_sse2(
    dst: *mut u8,
    dst_stride: usize,
    src: *const u8,
    src_stride: usize,
    width: usize,
    height: usize,
) {
    use std::arch::x86_64::{_mm_loadu_si128, _mm_prefetch, _mm_storeu_si128, _MM_HINT_NTA};

    for row in 0..height {
        let mut s = src.add(row * src_stride);
        let mut d = dst.add(row * dst_stride);

        if row + PREFETCH_ROWS < height {
            _mm_prefetch::<_MM_HINT_NTA>(src.add((row + PREFETCH_ROWS) * src_stride) as *const i8);
        }

        let mut remaining = width;
        while remaining >= SIMD_CHUNK {
            let lo = _mm_loadu_si128(s as *const _);
            let hi = _mm_loadu_si128(s.add(16) as *const _);
            _mm_storeu_si128(d as *mut _, lo);
            _mm_storeu_si128(d.add(16) as *mut _, hi);
            s = s.add(SIMD_CHUNK);
            d = d.add(SIMD_CHUNK);
            remaining -= SIMD_CHUNK;
        }
        std::ptr::copy_nonoverlapping(s, d, remaining);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_copy(
        dst: &mut [u8],
        dst_stride: usize,
        src: &[u8],
        src_stride: usize,
        width: usize,
        height: usize,
    ) {
        for row in 0..height {
            for col in 0..width {
                dst[row * dst_stride + col] = src[row * src_stride + col];
            }
        }
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect()
    }

    #[test]
    fn matches_reference_across_stride_grid() {
        // Widths straddle the 32-byte SIMD chunk and its remainders.
        for &width in &[1usize, 15, 16, 31, 32, 33, 63, 64, 65, 100, 257] {
            for &src_pad in &[0usize, 1, 13, 64] {
                for &dst_pad in &[0usize, 7, 64] {
                    let height = 5;
                    let src_stride = width + src_pad;
                    let dst_stride = width + dst_pad;
                    let src = pattern(src_stride * height, 3);

                    let mut got = vec![0xAAu8; dst_stride * height];
                    let mut want = vec![0xAAu8; dst_stride * height];
                    copy_plane(&mut got, dst_stride, &src, src_stride, width, height);
                    reference_copy(&mut want, dst_stride, &src, src_stride, width, height);
                    assert_eq!(
                        got, want,
                        "w={width} src_stride={src_stride} dst_stride={dst_stride}"
                    );
                }
            }
        }
    }

    #[test]
    fn padding_bytes_stay_untouched() {
        let width = 40;
        let height = 4;
        let src_stride = 48;
        let dst_stride = 50;
        let src = pattern(src_stride * height, 9);
        let mut dst = vec![0x55u8; dst_stride * height];

        copy_plane(&mut dst, dst_stride, &src, src_stride, width, height);

        for row in 0..height {
            for col in width..dst_stride {
                assert_eq!(dst[row * dst_stride + col], 0x55, "row {row} col {col}");
            }
        }
    }

    #[test]
    fn zero_sized_copy_is_a_no_op() {
        let src = [1u8, 2, 3];
        let mut dst = [9u8; 3];
        copy_plane(&mut dst, 3, &src, 3, 0, 1);
        copy_plane(&mut dst, 3, &src, 3, 1, 0);
        assert_eq!(dst, [9, 9, 9]);
    }

    #[test]
    #[should_panic]
    fn narrow_stride_is_rejected() {
        let src = [0u8; 16];
        let mut dst = [0u8; 16];
        copy_plane(&mut dst, 4, &src, 4, 8, 2);
    }

    #[test]
    fn tall_copy_exercises_prefetch_lookahead() {
        let width = 64;
        let height = 32; // well past PREFETCH_ROWS
        let src_stride = 80;
        let dst_stride = 64;
        let src = pattern(src_stride * height, 17);
        let mut got = vec![0u8; dst_stride * height];
        let mut want = vec![0u8; dst_stride * height];

        copy_plane(&mut got, dst_stride, &src, src_stride, width, height);
        reference_copy(&mut want, dst_stride, &src, src_stride, width, height);
        assert_eq!(got, want);
    }
}

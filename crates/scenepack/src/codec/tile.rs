//! Mask-gated tile copy.
//!
//! Both planes are 2D arrays of 4-byte cells (`bx` x `by` blocks). A byte
//! mask `t` of `tx` x `ty` is tiled across the plane with a phase shift
//! derived from `(repx, repy)`; a cell copies iff its mask byte compares
//! against `limit` in the direction selected by `rev`. The source_angou
//! codec applies this four times with complementary senses, so every cell
//! is written by exactly one of the two passes per plane.

fn phase(rep: i32, t: usize) -> usize {
    let t = t as i32;
    let p = if rep <= 0 { (-rep) % t } else { (t - rep % t) % t };
    p as usize
}

/// Copies masked 4-byte cells from `src` to `dst`.
///
/// `dst` and `src` must both hold at least `bx * by * 4` bytes.
#[expect(clippy::too_many_arguments, reason = "mirrors the codec recipe parameter list")]
pub fn tile_copy(
    dst: &mut [u8],
    src: &[u8],
    bx: usize,
    by: usize,
    mask: &[u8],
    tx: usize,
    ty: usize,
    repx: i32,
    repy: i32,
    rev: bool,
    limit: u8,
) {
    let x0 = phase(repx, tx);
    let y0 = phase(repy, ty);
    for y in 0..by {
        let tx_i = (y0 + y) % ty;
        for x in 0..bx {
            let ty_i = (x0 + x) % tx;
            let v = mask[tx_i * tx + ty_i];
            let selected = if rev { v < limit } else { v >= limit };
            if selected {
                let ofs = (y * bx + x) * 4;
                dst[ofs..ofs + 4].copy_from_slice(&src[ofs..ofs + 4]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complementary_passes_cover_every_cell() {
        let bx = 5;
        let by = 4;
        let mask: Vec<u8> = (0..9).map(|i| i * 30).collect(); // 3x3 tile
        let src_a: Vec<u8> = (0..bx * by * 4).map(|i| i as u8).collect();
        let src_b: Vec<u8> = (0..bx * by * 4).map(|i| 0x80 | i as u8).collect();
        let mut dst = vec![0u8; bx * by * 4];
        tile_copy(&mut dst, &src_a, bx, by, &mask, 3, 3, 2, -1, false, 0x5A);
        tile_copy(&mut dst, &src_b, bx, by, &mask, 3, 3, 2, -1, true, 0x5A);
        // Inverting with the same senses recovers each plane.
        let mut back_a = vec![0u8; bx * by * 4];
        let mut back_b = vec![0u8; bx * by * 4];
        tile_copy(&mut back_a, &dst, bx, by, &mask, 3, 3, 2, -1, false, 0x5A);
        tile_copy(&mut back_b, &dst, bx, by, &mask, 3, 3, 2, -1, true, 0x5A);
        for i in 0..dst.len() {
            assert!(back_a[i] == src_a[i] || back_b[i] == src_b[i]);
            assert!(back_a[i] == src_a[i] || back_a[i] == 0);
        }
    }

    #[test]
    fn negative_and_positive_phases_differ() {
        let mask = [0u8, 255, 0, 255];
        let src = [1u8; 16];
        let mut d1 = [0u8; 16];
        let mut d2 = [0u8; 16];
        tile_copy(&mut d1, &src, 2, 2, &mask, 2, 2, 0, 0, false, 128);
        tile_copy(&mut d2, &src, 2, 2, &mask, 2, 2, 1, 0, false, 128);
        assert_ne!(d1, d2);
    }
}

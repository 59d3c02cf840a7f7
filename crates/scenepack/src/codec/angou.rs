//! The source_angou envelope and the exe-XOR key derivation.
//!
//! source_angou wraps arbitrary bytes in a self-describing encrypted
//! envelope: LZSS + easy-XOR body, a 68-byte md5_code block driving the
//! mask/map geometry, a name record, two tile-scrambled payload planes,
//! and a final whole-buffer XOR. Decode inverts the layers in reverse and
//! verifies the digest.

use crate::{
    charset::{decode_utf16le, encode_utf16le},
    codec::{lzss, md5_digest, tile::tile_copy, xor::xor_cycle_inplace},
    error::ErrorCode,
    keys::{EXE_ORG, SourceAngouRecipe},
};

/// Folds the user secret into the engine's 16-byte exe-XOR block.
///
/// Walks `max(len(secret), 16)` steps so that both the secret and the
/// block wrap at least once.
pub fn exe_angou_element(secret: &[u8]) -> [u8; 16] {
    let mut block = EXE_ORG;
    if secret.is_empty() {
        return block;
    }
    let n = secret.len();
    let m = block.len();
    let cnt = n.max(m);
    let mut a = 0;
    let mut b = 0;
    for _ in 0..cnt {
        block[b] ^= secret[a];
        a += 1;
        b += 1;
        if a == n {
            a = 0;
        }
        if b == m {
            b = 0;
        }
    }
    block
}

fn md5_dword(md5_code: &[u8], ofs: usize) -> u32 {
    if ofs + 4 > md5_code.len() {
        return 0;
    }
    u32::from_le_bytes(md5_code[ofs..ofs + 4].try_into().unwrap())
}

fn derive_dim(md5_code: &[u8], recipe: (usize, u32, u32)) -> usize {
    let (ofs, modulus, addend) = recipe;
    (md5_dword(md5_code, ofs) % modulus + addend) as usize
}

/// Builds the 68-byte md5_code block for a compressed body.
fn build_md5_code(lz: &[u8]) -> [u8; 68] {
    let mut code = [0u8; 68];
    code[..16].copy_from_slice(&md5_digest(lz));
    let n = lz.len();
    let low = (n + 1) & 0x3F;
    let n65 = if low <= 0x38 { 65usize } else { 129 };
    let v13 = n65 - low;
    let v73 = (n as u32).wrapping_mul(8);
    let idx = v13 + 60;
    // Length scribble; with a 68-byte block the guard never admits it,
    // matching the engine's layout.
    if idx + 4 <= code.len() {
        code[idx] = (v73 & 0xFF) as u8;
        code[idx + 1] = ((n >> 5) & 0xFF) as u8;
        code[idx + 2] = ((v73 >> 16) & 0xFF) as u8;
        code[idx + 3] = ((v73 >> 24) & 0xFF) as u8;
    }
    code[64..68].copy_from_slice(&(n as u32).to_le_bytes());
    code
}

fn build_mask(md5_code: &[u8], recipe: &SourceAngouRecipe, mw: usize, mh: usize) -> Vec<u8> {
    let mut mask = vec![0u8; mw * mh];
    let mut ind = recipe.mask_index;
    let mut mi = recipe.mask_md5_index;
    for m in &mut mask {
        *m = recipe.mask_code[ind % recipe.mask_code.len()] ^ md5_code[(mi % 16) * 4];
        ind += 1;
        mi = (mi + 1) % 16;
    }
    mask
}

struct Geometry {
    mw: usize,
    mh: usize,
    bh: usize,
    map_total: usize,
}

fn derive_geometry(md5_code: &[u8], recipe: &SourceAngouRecipe, lz_len: usize) -> Geometry {
    let mw = derive_dim(md5_code, recipe.mask_w);
    let mh = derive_dim(md5_code, recipe.mask_h);
    let map_w = derive_dim(md5_code, recipe.map_w);
    let bh = (lz_len + 1) / 2;
    let dh = (bh + 3) / 4;
    let map_h = (dh + map_w - 1) / map_w;
    Geometry {
        mw,
        mh,
        bh,
        map_total: map_w * map_h * 4,
    }
}

fn map_w_of(md5_code: &[u8], recipe: &SourceAngouRecipe) -> usize {
    derive_dim(md5_code, recipe.map_w)
}

/// Encrypts `data` under `name` with the source_angou recipe.
pub fn source_angou_encrypt(data: &[u8], name: &str, recipe: &SourceAngouRecipe, lzss_level: u32) -> Vec<u8> {
    let mut lz = lzss::pack_level(data, lzss_level);
    xor_cycle_inplace(&mut lz, recipe.easy_code, recipe.easy_index);
    let md5_code = build_md5_code(&lz);
    let mut name_bytes = encode_utf16le(name);
    xor_cycle_inplace(&mut name_bytes, recipe.name_code, recipe.name_index);

    let geo = derive_geometry(&md5_code, recipe, lz.len());
    let mask = build_mask(&md5_code, recipe, geo.mw, geo.mh);
    let map_w = map_w_of(&md5_code, recipe);
    let map_h = if map_w == 0 { 0 } else { geo.map_total / (map_w * 4) };

    // Working buffer: the body followed by a keyed garbage stream.
    let mut lzb = vec![0u8; geo.map_total * 2];
    lzb[..lz.len()].copy_from_slice(&lz);
    let mut ind = recipe.gomi_index;
    let mut mi = recipe.gomi_md5_index;
    for slot in &mut lzb[lz.len()..] {
        *slot = recipe.gomi_code[ind % recipe.gomi_code.len()] ^ md5_code[(mi % 16) * 4];
        ind += 1;
        mi = (mi + 1) % 16;
    }

    let hs = recipe.header_size;
    let mut out = vec![0u8; hs + 4 + name_bytes.len() + geo.map_total * 2];
    out[0..4].copy_from_slice(&1u32.to_le_bytes());
    out[4..hs].copy_from_slice(&md5_code);
    out[hs..hs + 4].copy_from_slice(&(name_bytes.len() as u32).to_le_bytes());
    let p = hs + 4;
    out[p..p + name_bytes.len()].copy_from_slice(&name_bytes);
    let dp1 = p + name_bytes.len();
    let dp2 = dp1 + geo.map_total;
    let (repx, repy, lim) = (recipe.tile_repx, recipe.tile_repy, recipe.tile_limit);
    let sp1 = &lzb[..geo.map_total];
    let sp2 = &lzb[geo.bh..geo.bh + geo.map_total];
    tile_copy(&mut out[dp1..dp2], sp1, map_w, map_h, &mask, geo.mw, geo.mh, repx, repy, false, lim);
    tile_copy(&mut out[dp1..dp2], sp2, map_w, map_h, &mask, geo.mw, geo.mh, repx, repy, true, lim);
    tile_copy(&mut out[dp2..], sp1, map_w, map_h, &mask, geo.mw, geo.mh, repx, repy, true, lim);
    tile_copy(&mut out[dp2..], sp2, map_w, map_h, &mask, geo.mw, geo.mh, repx, repy, false, lim);
    xor_cycle_inplace(&mut out, recipe.last_code, recipe.last_index);
    out
}

/// Decrypts a source_angou envelope, returning `(payload, name)`.
pub fn source_angou_decrypt(enc: &[u8], recipe: &SourceAngouRecipe) -> Result<(Vec<u8>, String), ErrorCode> {
    let hs = recipe.header_size;
    if enc.len() < hs + 4 {
        return Err(ErrorCode::AngouTruncated);
    }
    let mut dec = enc.to_vec();
    xor_cycle_inplace(&mut dec, recipe.last_code, recipe.last_index);
    let version = u32::from_le_bytes(dec[0..4].try_into().unwrap());
    if version != 1 {
        return Err(ErrorCode::AngouBadVersion);
    }
    let md5_code = dec[4..hs].to_vec();
    let name_len = u32::from_le_bytes(dec[hs..hs + 4].try_into().unwrap()) as usize;
    let mut p = hs + 4;
    if p + name_len > dec.len() {
        return Err(ErrorCode::AngouTruncated);
    }
    let mut name_bytes = dec[p..p + name_len].to_vec();
    xor_cycle_inplace(&mut name_bytes, recipe.name_code, recipe.name_index);
    let name = decode_utf16le(&name_bytes);
    p += name_len;

    let lz_len = md5_dword(&md5_code, 64) as usize;
    let geo = derive_geometry(&md5_code, recipe, lz_len);
    let mask = build_mask(&md5_code, recipe, geo.mw, geo.mh);
    let map_w = map_w_of(&md5_code, recipe);
    let map_h = if map_w == 0 { 0 } else { geo.map_total / (map_w * 4) };
    if p + geo.map_total * 2 > dec.len() {
        return Err(ErrorCode::AngouTruncated);
    }
    let dp1 = &dec[p..p + geo.map_total];
    let dp2 = &dec[p + geo.map_total..p + geo.map_total * 2];

    let mut lzb = vec![0u8; geo.map_total * 2];
    let (repx, repy, lim) = (recipe.tile_repx, recipe.tile_repy, recipe.tile_limit);
    tile_copy(&mut lzb[..geo.map_total], dp1, map_w, map_h, &mask, geo.mw, geo.mh, repx, repy, false, lim);
    tile_copy(&mut lzb[..geo.map_total], dp2, map_w, map_h, &mask, geo.mw, geo.mh, repx, repy, true, lim);
    tile_copy(
        &mut lzb[geo.bh..geo.bh + geo.map_total],
        dp2,
        map_w,
        map_h,
        &mask,
        geo.mw,
        geo.mh,
        repx,
        repy,
        false,
        lim,
    );
    tile_copy(
        &mut lzb[geo.bh..geo.bh + geo.map_total],
        dp1,
        map_w,
        map_h,
        &mask,
        geo.mw,
        geo.mh,
        repx,
        repy,
        true,
        lim,
    );

    let mut lz = lzb[..lz_len].to_vec();
    if md5_digest(&lz) != md5_code[..16] {
        return Err(ErrorCode::Md5Mismatch);
    }
    xor_cycle_inplace(&mut lz, recipe.easy_code, recipe.easy_index);
    let raw = lzss::unpack(&lz).ok_or(ErrorCode::LzssCorrupt)?;
    Ok((raw, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::SOURCE_ANGOU;

    #[test]
    fn exe_element_is_stable_and_secret_sensitive() {
        let a = exe_angou_element(b"password");
        let b = exe_angou_element(b"password");
        let c = exe_angou_element(b"passw0rd");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, EXE_ORG);
        assert_eq!(exe_angou_element(b""), EXE_ORG);
    }

    #[test]
    fn long_secret_wraps_the_block() {
        let secret = vec![0xAAu8; 40];
        let el = exe_angou_element(&secret);
        let mut expect = EXE_ORG;
        // 40 steps: positions 0..16 hit twice, 0..8 a third time.
        for i in 0..40 {
            expect[i % 16] ^= 0xAA;
        }
        assert_eq!(el, expect);
    }

    #[test]
    fn envelope_roundtrip() {
        let data = b"#command foo(int)\n*start\n\"hello world\"\n".repeat(20);
        let enc = source_angou_encrypt(&data, "scn\\title.ss", &SOURCE_ANGOU, 17);
        assert_ne!(&enc[..data.len().min(enc.len())], &data[..data.len().min(enc.len())]);
        let (dec, name) = source_angou_decrypt(&enc, &SOURCE_ANGOU).expect("decode");
        assert_eq!(dec, data);
        assert_eq!(name, "scn\\title.ss");
    }

    #[test]
    fn envelope_roundtrip_near_plane_boundaries() {
        // Sweep sizes around the 2*map_total split so both planes and the
        // garbage tail get exercised.
        for n in [0usize, 1, 2, 3, 15, 16, 17, 31, 63, 64, 65, 255, 1023] {
            let data: Vec<u8> = (0..n).map(|i| (i * 7) as u8).collect();
            let enc = source_angou_encrypt(&data, "x", &SOURCE_ANGOU, 17);
            let (dec, _) = source_angou_decrypt(&enc, &SOURCE_ANGOU).expect("decode");
            assert_eq!(dec, data, "size {n}");
        }
    }

    #[test]
    fn tampering_fails_the_digest() {
        let data = b"some scene text, long enough to compress".to_vec();
        let mut enc = source_angou_encrypt(&data, "n", &SOURCE_ANGOU, 17);
        // Flip a byte in the first payload cell: it scrambles back into the
        // body range the digest covers (the trailing garbage would not).
        let dp1 = SOURCE_ANGOU.header_size + 4 + 2;
        enc[dp1] ^= 0xFF;
        assert_eq!(source_angou_decrypt(&enc, &SOURCE_ANGOU), Err(ErrorCode::Md5Mismatch));
    }

    #[test]
    fn truncated_and_bad_version_envelopes_are_rejected() {
        assert_eq!(
            source_angou_decrypt(&[0u8; 8], &SOURCE_ANGOU),
            Err(ErrorCode::AngouTruncated)
        );
        let data = b"abc".to_vec();
        let enc = source_angou_encrypt(&data, "n", &SOURCE_ANGOU, 17);
        let mut broken = enc.clone();
        // XOR is linear, so flipping a ciphertext bit flips the version bit.
        broken[0] ^= 0x04;
        assert_eq!(
            source_angou_decrypt(&broken, &SOURCE_ANGOU),
            Err(ErrorCode::AngouBadVersion)
        );
    }
}

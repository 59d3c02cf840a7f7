//! Key material for the archive codec layers.
//!
//! All tables in this module are opaque data captured from the engine this
//! toolchain targets. They are not derived from anything; changing a single
//! byte produces archives the runtime cannot read.

/// Cyclic XOR key applied to each scene blob after LZSS compression.
pub const EASY_ANGOU_CODE: &[u8] = &[
    0xC9, 0x64, 0xF1, 0x39, 0x0F, 0x55, 0x68, 0xC0, 0x14, 0x0D, 0xA1, 0x9D,
    0xEE, 0x9C, 0xF2, 0xF1, 0x6C, 0xBD, 0x67, 0xF1, 0x16, 0x51, 0x9B, 0x2C,
    0xEC, 0x69, 0x9D, 0x5A, 0xFD, 0x6D, 0xD7, 0xB5, 0xBC, 0x83, 0x73, 0xC4,
    0x19, 0x2D, 0xDF, 0x33, 0xEC, 0x74, 0x29, 0x2D, 0x7F, 0xD2, 0x5B, 0x0F,
];

/// Baseline XOR key for the `Gameexe.dat` payload.
pub const GAMEEXE_DAT_ANGOU_CODE: &[u8] = &[
    0xB6, 0x9A, 0xB4, 0x35, 0xE8, 0x67, 0x56, 0x4C, 0x24, 0x36, 0x9D, 0x7F,
    0xC3, 0x56, 0x8F, 0xB5, 0x90, 0xDA, 0xE3, 0xE1, 0x72, 0xFA, 0xAF, 0x97,
    0x94, 0x07, 0xAF, 0x48, 0x8D, 0xE5, 0xFF, 0xA5, 0x2E, 0xEF, 0xF2, 0x65,
    0x65, 0x6D, 0x04, 0x6B, 0x32, 0xA1, 0x5B, 0x81, 0x84, 0x36, 0x2E, 0xCE,
    0x83, 0x7E, 0x27, 0x4B, 0x74, 0x90, 0x45, 0x7C, 0x87, 0x82, 0x9A, 0x3A,
    0xFA, 0x88, 0xCF, 0xF9,
];

/// Initial contents of the exe-XOR key block before the user secret is
/// folded in. The runtime holds the same 16 bytes.
pub const EXE_ORG: [u8; 16] = [
    0xE6, 0x1B, 0xA5, 0x8D, 0x7A, 0xA9, 0x93, 0xDB, 0xBF, 0xC7, 0xC0, 0x85,
    0x8D, 0xBA, 0x24, 0x7E,
];

/// Byte order of the first `EXE_ANGOU.h` define block.
pub const EXE_ANGOU_A_IDX: [usize; 8] = [14, 5, 15, 8, 7, 4, 11, 6];
/// Byte order of the second `EXE_ANGOU.h` define block.
pub const EXE_ANGOU_B_IDX: [usize; 8] = [3, 13, 9, 12, 2, 1, 0, 10];

/// Parameters of the source_angou content-scrambling codec.
///
/// Five key streams with their start offsets, the MD5-derived dimension
/// recipes for the tile mask and map, the envelope header size, and the
/// tile-copy phase parameters.
#[derive(Debug, Clone, Copy)]
pub struct SourceAngouRecipe {
    pub easy_code: &'static [u8],
    pub easy_index: usize,
    pub mask_code: &'static [u8],
    pub mask_index: usize,
    pub mask_md5_index: usize,
    pub gomi_code: &'static [u8],
    pub gomi_index: usize,
    pub gomi_md5_index: usize,
    pub last_code: &'static [u8],
    pub last_index: usize,
    pub name_code: &'static [u8],
    pub name_index: usize,
    /// `(md5_code_offset, modulus, addend)` for the mask width.
    pub mask_w: (usize, u32, u32),
    /// `(md5_code_offset, modulus, addend)` for the mask height.
    pub mask_h: (usize, u32, u32),
    /// `(md5_code_offset, modulus, addend)` for the map width.
    pub map_w: (usize, u32, u32),
    /// Envelope header size: 4-byte version + the 68-byte md5_code block.
    pub header_size: usize,
    pub tile_repx: i32,
    pub tile_repy: i32,
    pub tile_limit: u8,
}

/// The recipe the target runtime ships with.
pub const SOURCE_ANGOU: SourceAngouRecipe = SourceAngouRecipe {
    easy_code: &[
        0x2E, 0x4F, 0xD4, 0x78, 0xD0, 0x72, 0x76, 0xAD, 0x45, 0x50, 0x96, 0x20,
        0xB3, 0x6E, 0x85, 0x4D, 0x58, 0x5E, 0xE4, 0x55, 0x20, 0x9D, 0xD4, 0x86,
        0x7A, 0xBC, 0xA8, 0xD5, 0xB4, 0x2C, 0xE2, 0x79, 0x68, 0xB3, 0x7C, 0xBB,
        0xAD, 0x0B, 0x34, 0xFC, 0xA8, 0x83, 0xEE, 0x50, 0x26, 0xEC, 0x01, 0x36,
    ],
    easy_index: 5,
    mask_code: &[
        0x95, 0xEE, 0x99, 0x5B, 0x7C, 0xB0, 0x6D, 0xD2, 0x83, 0x4E, 0xCE, 0x48,
        0x90, 0x5B, 0x66, 0x23, 0x94, 0x47, 0x15, 0x89, 0x47, 0x7D, 0x99, 0xD3,
        0x96, 0x50, 0xF3, 0xDD, 0x47, 0x96, 0xF8, 0xE3, 0x06, 0xC6, 0x82, 0xC9,
        0x33, 0x0F, 0x9A, 0xC4, 0xB7, 0xF7, 0xC6, 0x11, 0xB8, 0x43, 0x4C, 0x01,
        0x43, 0xCD, 0x58, 0xF1, 0xE2, 0xF6, 0x56, 0xC3, 0x26, 0xBC, 0x2B, 0x30,
        0xDC, 0xFD, 0xD1, 0xC8,
    ],
    mask_index: 11,
    mask_md5_index: 3,
    gomi_code: &[
        0x66, 0x8D, 0xF8, 0x06, 0xBA, 0x3B, 0x9B, 0x1B, 0xBA, 0x04, 0x50, 0x62,
        0xEF, 0xAD, 0x3D, 0x06, 0x9F, 0x3F, 0xB7, 0xE4, 0x00, 0x2D, 0x65, 0x6C,
        0x2E, 0x2F, 0xEE, 0x54, 0x47, 0x54, 0xE0, 0x8D, 0x9A, 0x92, 0x37, 0x5F,
        0xEF, 0x43, 0x90, 0xBF, 0x3D, 0x09, 0x3E, 0x8C, 0x46, 0xE5, 0x21, 0xEA,
        0x51, 0x44, 0xD1, 0x49, 0xE3, 0xEA, 0xCA, 0x67, 0x40, 0xA0, 0xB2, 0xC1,
        0xEA, 0xC0, 0x54, 0x2D, 0xB5, 0x2B, 0xA9, 0x77, 0x67, 0xC0, 0x62, 0xAB,
        0x84, 0xEB, 0xB8, 0xA1, 0x6A, 0x70, 0x80, 0x0A, 0x46, 0x19, 0xE7, 0xA0,
        0xF2, 0x23, 0x22, 0xEF, 0x83, 0x1B, 0x23, 0x0B, 0x6F, 0xE3, 0x99, 0x2D,
    ],
    gomi_index: 7,
    gomi_md5_index: 9,
    last_code: &[
        0xCB, 0xD3, 0xD3, 0xFD, 0xB0, 0x77, 0xD0, 0x10, 0x1C, 0xF1, 0xA1, 0xD9,
        0x71, 0x7D, 0xBB, 0x63, 0x58, 0xAE, 0xA6, 0x5F, 0x05, 0xF8, 0xA3, 0xFB,
        0xCB, 0xC6, 0xAA, 0xD4, 0x92, 0xF5, 0xEE, 0x7B, 0x17, 0xF3, 0xB1, 0x8C,
        0x7C, 0xE4, 0x4F, 0x73, 0xAB, 0x53, 0xE2, 0xF1, 0xAB, 0x7A, 0x49, 0xBA,
        0xF8, 0xC3, 0x95, 0x80, 0x6F, 0xE1, 0x16, 0x82, 0x11, 0x7F, 0x9A, 0xCE,
        0xC0, 0xA0, 0x8C, 0x2E, 0x54, 0xB8, 0xAE, 0x92, 0x74, 0x24, 0x50, 0x94,
        0xFF, 0xC3, 0x94, 0x10, 0x74, 0xA1, 0xDD, 0x22, 0xD5, 0xEA, 0x9E, 0x13,
        0x4F, 0x94, 0xE8, 0x8C, 0xFE, 0xC8, 0xED, 0xE3, 0xAA, 0xCA, 0xA3, 0xA6,
        0xE9, 0xC0, 0x42, 0x72, 0xE9, 0xF5, 0xEC, 0x0F, 0x07, 0x8A, 0x00, 0xF0,
        0x1D, 0x7E, 0x77, 0x7D, 0x8E, 0x2F, 0xF4, 0xBA, 0x74, 0x3B, 0xFA, 0xDB,
        0xC4, 0xB9, 0xEB, 0x3A, 0xCF, 0x70, 0x0E, 0x99,
    ],
    last_index: 13,
    name_code: &[
        0x51, 0x65, 0x84, 0xE8, 0x89, 0x7D, 0x51, 0xF1, 0xDD, 0x92, 0x88, 0x4D,
        0x04, 0x52, 0xC1, 0x87, 0xC1, 0x98, 0xB8, 0x57, 0xE7, 0x8D, 0xD5, 0xE4,
        0xCF, 0xB4, 0x12, 0xD9, 0x03, 0xCD, 0x9D, 0x5B,
    ],
    name_index: 3,
    mask_w: (0, 8, 8),
    mask_h: (4, 8, 8),
    map_w: (8, 24, 8),
    header_size: 72,
    tile_repx: 3,
    tile_repy: 5,
    tile_limit: 0x80,
};

//! Linker: assembles per-scene `.dat` outputs into `Scene.pck`.
//!
//! Each scene blob may be stored raw (`--no-angou`) or LZSS-compressed and
//! easy-XORed, with an optional second exe-XOR layer. After the scene data
//! an encrypted original-sources appendix may follow: a size table wrapped
//! in the source_angou codec under the placeholder name, then one
//! independently wrapped chunk per file.

use crate::{
    bs::parse_cmd_labels,
    codec::xor::xor_cycle_inplace,
    error::{CompileError, CompileResult, ErrorCode},
    ia::{IncData, IncProperty},
};

/// The archive header: 23 little-endian i32 fields, 92 bytes.
pub const PACK_HEADER_SIZE: usize = 92;
const PACK_FIELD_CNT: usize = PACK_HEADER_SIZE / 4;

/// Parsed `Scene.pck` header, wire order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackHeader {
    pub header_size: i32,
    pub scn_data_exe_angou_mod: i32,
    pub original_source_header_size: i32,
    pub inc_prop_list_ofs: i32,
    pub inc_prop_cnt: i32,
    pub inc_prop_name_index_list_ofs: i32,
    pub inc_prop_name_index_cnt: i32,
    pub inc_prop_name_list_ofs: i32,
    pub inc_prop_name_cnt: i32,
    pub inc_cmd_list_ofs: i32,
    pub inc_cmd_cnt: i32,
    pub inc_cmd_name_index_list_ofs: i32,
    pub inc_cmd_name_index_cnt: i32,
    pub inc_cmd_name_list_ofs: i32,
    pub inc_cmd_name_cnt: i32,
    pub scn_name_index_list_ofs: i32,
    pub scn_name_index_cnt: i32,
    pub scn_name_list_ofs: i32,
    pub scn_name_cnt: i32,
    pub scn_data_index_list_ofs: i32,
    pub scn_data_index_cnt: i32,
    pub scn_data_list_ofs: i32,
    pub scn_data_cnt: i32,
}

impl PackHeader {
    fn fields(&self) -> [i32; PACK_FIELD_CNT] {
        [
            self.header_size,
            self.scn_data_exe_angou_mod,
            self.original_source_header_size,
            self.inc_prop_list_ofs,
            self.inc_prop_cnt,
            self.inc_prop_name_index_list_ofs,
            self.inc_prop_name_index_cnt,
            self.inc_prop_name_list_ofs,
            self.inc_prop_name_cnt,
            self.inc_cmd_list_ofs,
            self.inc_cmd_cnt,
            self.inc_cmd_name_index_list_ofs,
            self.inc_cmd_name_index_cnt,
            self.inc_cmd_name_list_ofs,
            self.inc_cmd_name_cnt,
            self.scn_name_index_list_ofs,
            self.scn_name_index_cnt,
            self.scn_name_list_ofs,
            self.scn_name_cnt,
            self.scn_data_index_list_ofs,
            self.scn_data_index_cnt,
            self.scn_data_list_ofs,
            self.scn_data_cnt,
        ]
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        for (i, v) in self.fields().iter().enumerate() {
            buf[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
        }
    }

    pub fn parse(dat: &[u8]) -> Option<Self> {
        if dat.len() < PACK_HEADER_SIZE {
            return None;
        }
        let f = |i: usize| i32::from_le_bytes(dat[i * 4..i * 4 + 4].try_into().unwrap());
        let mut h = Self::default();
        let mut i = 0;
        macro_rules! read {
            ($($field:ident),+ $(,)?) => {
                $(
                    h.$field = f(i);
                    i += 1;
                )+
            };
        }
        read!(
            header_size,
            scn_data_exe_angou_mod,
            original_source_header_size,
            inc_prop_list_ofs,
            inc_prop_cnt,
            inc_prop_name_index_list_ofs,
            inc_prop_name_index_cnt,
            inc_prop_name_list_ofs,
            inc_prop_name_cnt,
            inc_cmd_list_ofs,
            inc_cmd_cnt,
            inc_cmd_name_index_list_ofs,
            inc_cmd_name_index_cnt,
            inc_cmd_name_list_ofs,
            inc_cmd_name_cnt,
            scn_name_index_list_ofs,
            scn_name_index_cnt,
            scn_name_list_ofs,
            scn_name_cnt,
            scn_data_index_list_ofs,
            scn_data_index_cnt,
            scn_data_list_ofs,
            scn_data_cnt,
        );
        debug_assert_eq!(i, PACK_FIELD_CNT);
        Some(h)
    }
}

fn push_section(buf: &mut Vec<u8>, section: &[u8]) -> i32 {
    let ofs = buf.len() as i32;
    buf.extend_from_slice(section);
    ofs
}

fn pack_i32_pairs(pairs: &[(i32, i32)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(pairs.len() * 8);
    for &(a, b) in pairs {
        out.extend_from_slice(&a.to_le_bytes());
        out.extend_from_slice(&b.to_le_bytes());
    }
    out
}

fn string_section(names: &[String]) -> (Vec<(i32, i32)>, Vec<u8>) {
    let mut idx = Vec::with_capacity(names.len());
    let mut blob = Vec::new();
    let mut ofs = 0i32;
    for n in names {
        let len = n.encode_utf16().count() as i32;
        idx.push((ofs, len));
        for unit in n.encode_utf16() {
            blob.extend_from_slice(&unit.to_le_bytes());
        }
        ofs += len;
    }
    (idx, blob)
}

fn blob_section(blobs: &[Vec<u8>]) -> (Vec<(i32, i32)>, Vec<u8>) {
    let mut idx = Vec::with_capacity(blobs.len());
    let mut blob = Vec::new();
    let mut ofs = 0i32;
    for b in blobs {
        idx.push((ofs, b.len() as i32));
        blob.extend_from_slice(b);
        ofs += b.len() as i32;
    }
    (idx, blob)
}

/// Folds each scene's `cmd_label_list` into the archive-wide
/// `(scene_no, offset)` table, checking that every `.inc`-declared command
/// is defined exactly once across the compilation unit.
pub fn resolve_inc_cmd_list(inc: &IncData, scene_dats: &[Vec<u8>]) -> CompileResult<Vec<(i32, i32)>> {
    let inc_cmd_cnt = inc.inc_command_cnt;
    let mut list = vec![(0i32, 0i32); inc.command_list.len()];
    let mut defined = vec![false; inc.command_list.len()];
    let mut any_labels = false;
    for (scene_no, dat) in scene_dats.iter().enumerate() {
        for (cmd_id, ofs) in parse_cmd_labels(dat) {
            any_labels = true;
            let id = cmd_id as usize;
            if id < inc_cmd_cnt && id < list.len() {
                if defined[id] {
                    let name = inc.command_list[id].name.clone();
                    return Err(CompileError::new(ErrorCode::LinkCmdMultiplyDefined, name, 0));
                }
                list[id] = (scene_no as i32, ofs);
                defined[id] = true;
            }
        }
    }
    if any_labels {
        for (id, cmd) in inc.command_list.iter().take(inc_cmd_cnt).enumerate() {
            if !defined[id] {
                return Err(CompileError::new(ErrorCode::LinkCmdNotDefined, cmd.name.clone(), 0));
            }
        }
    }
    Ok(list)
}

/// Everything that goes into one archive image.
pub struct PackInputs<'a> {
    pub inc_props: &'a [IncProperty],
    pub inc_prop_names: &'a [String],
    pub inc_cmd_names: &'a [String],
    pub inc_cmd_list: &'a [(i32, i32)],
    pub scn_name_list: &'a [String],
    pub scn_data_list: &'a [Vec<u8>],
    pub scn_data_exe_angou_mod: i32,
    pub original_source_header_size: i32,
    pub original_chunks: &'a [Vec<u8>],
}

/// Lays out the archive image with its 23-field header.
pub fn build_pack_bytes(inputs: &PackInputs<'_>) -> Vec<u8> {
    let mut h = PackHeader {
        header_size: PACK_HEADER_SIZE as i32,
        scn_data_exe_angou_mod: inputs.scn_data_exe_angou_mod,
        original_source_header_size: inputs.original_source_header_size,
        ..PackHeader::default()
    };
    let mut buf = vec![0u8; PACK_HEADER_SIZE];

    let inc_prop_blob: Vec<u8> = inputs
        .inc_props
        .iter()
        .flat_map(|p| {
            let mut b = p.form.code().to_le_bytes().to_vec();
            b.extend_from_slice(&p.size.to_le_bytes());
            b
        })
        .collect();
    h.inc_prop_list_ofs = push_section(&mut buf, &inc_prop_blob);
    h.inc_prop_cnt = inputs.inc_props.len() as i32;

    let (prop_idx, prop_blob) = string_section(inputs.inc_prop_names);
    h.inc_prop_name_index_list_ofs = push_section(&mut buf, &pack_i32_pairs(&prop_idx));
    h.inc_prop_name_index_cnt = prop_idx.len() as i32;
    h.inc_prop_name_list_ofs = push_section(&mut buf, &prop_blob);
    h.inc_prop_name_cnt = inputs.inc_prop_names.len() as i32;

    h.inc_cmd_list_ofs = push_section(&mut buf, &pack_i32_pairs(inputs.inc_cmd_list));
    h.inc_cmd_cnt = inputs.inc_cmd_list.len() as i32;

    let (cmd_idx, cmd_blob) = string_section(inputs.inc_cmd_names);
    h.inc_cmd_name_index_list_ofs = push_section(&mut buf, &pack_i32_pairs(&cmd_idx));
    h.inc_cmd_name_index_cnt = cmd_idx.len() as i32;
    h.inc_cmd_name_list_ofs = push_section(&mut buf, &cmd_blob);
    h.inc_cmd_name_cnt = inputs.inc_cmd_names.len() as i32;

    let (name_idx, name_blob) = string_section(inputs.scn_name_list);
    h.scn_name_index_list_ofs = push_section(&mut buf, &pack_i32_pairs(&name_idx));
    h.scn_name_index_cnt = name_idx.len() as i32;
    h.scn_name_list_ofs = push_section(&mut buf, &name_blob);
    h.scn_name_cnt = inputs.scn_name_list.len() as i32;

    let (data_idx, data_blob) = blob_section(inputs.scn_data_list);
    h.scn_data_index_list_ofs = push_section(&mut buf, &pack_i32_pairs(&data_idx));
    h.scn_data_index_cnt = data_idx.len() as i32;
    h.scn_data_list_ofs = push_section(&mut buf, &data_blob);
    h.scn_data_cnt = inputs.scn_data_list.len() as i32;

    for chunk in inputs.original_chunks {
        push_section(&mut buf, chunk);
    }

    h.write_to(&mut buf[..PACK_HEADER_SIZE]);
    buf
}

/// Applies the exe-XOR layer over each scene blob.
pub fn apply_exe_layer(blobs: &[Vec<u8>], exe_el: &[u8; 16]) -> Vec<Vec<u8>> {
    blobs
        .iter()
        .map(|b| {
            let mut out = b.clone();
            xor_cycle_inplace(&mut out, exe_el, 0);
            out
        })
        .collect()
}

/// Scene names are lower-cased `.ss` basenames without extension.
pub fn scene_name(file_name: &str) -> String {
    let base = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
    let stem = base.rsplit_once('.').map_or(base, |(s, _)| s);
    stem.to_lowercase()
}

/// Declared property list restricted to the `.inc` boundary; the archive
/// carries only pre-declared entries.
pub fn inc_props(inc: &IncData) -> &[IncProperty] {
    &inc.property_list[..inc.inc_property_cnt.min(inc.property_list.len())]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn header_roundtrip() {
        let h = PackHeader {
            header_size: PACK_HEADER_SIZE as i32,
            scn_data_exe_angou_mod: 1,
            scn_name_cnt: 3,
            scn_data_cnt: 3,
            ..PackHeader::default()
        };
        let mut buf = vec![0u8; PACK_HEADER_SIZE];
        h.write_to(&mut buf);
        assert_eq!(PackHeader::parse(&buf), Some(h));
        assert!(PackHeader::parse(&buf[..90]).is_none());
    }

    #[test]
    fn scene_names_are_lowercased_stems() {
        assert_eq!(scene_name("Title.SS"), "title");
        assert_eq!(scene_name("dir/Sub/EV_01.ss"), "ev_01");
        assert_eq!(scene_name("noext"), "noext");
    }

    #[test]
    fn pack_counts_are_consistent() {
        let names = vec!["a".to_owned(), "b".to_owned()];
        let blobs = vec![vec![1u8, 2, 3], vec![4u8, 5]];
        let pack = build_pack_bytes(&PackInputs {
            inc_props: &[],
            inc_prop_names: &[],
            inc_cmd_names: &[],
            inc_cmd_list: &[],
            scn_name_list: &names,
            scn_data_list: &blobs,
            scn_data_exe_angou_mod: 0,
            original_source_header_size: 0,
            original_chunks: &[],
        });
        let h = PackHeader::parse(&pack).unwrap();
        assert_eq!(h.scn_name_cnt, 2);
        assert_eq!(h.scn_data_cnt, 2);
        assert_eq!(h.scn_data_index_cnt, 2);
        // Blobs are verbatim and contiguous.
        let ofs = h.scn_data_list_ofs as usize;
        assert_eq!(&pack[ofs..ofs + 3], &[1, 2, 3]);
        assert_eq!(&pack[ofs + 3..ofs + 5], &[4, 5]);
    }

    #[test]
    fn exe_layer_is_an_involution() {
        let blobs = vec![vec![0u8; 40], (0..40u8).collect::<Vec<u8>>()];
        let el = crate::codec::angou::exe_angou_element(b"password");
        let once = apply_exe_layer(&blobs, &el);
        assert_ne!(once[1], blobs[1]);
        let twice = apply_exe_layer(&once, &el);
        assert_eq!(twice, blobs);
    }
}

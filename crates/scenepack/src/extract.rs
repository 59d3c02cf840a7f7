//! Extractor: inverts the archive layers back to per-scene `.dat` files
//! and recovers the embedded original sources.
//!
//! The original-source appendix is decoded first so a recovered `暗号.dat`
//! can supply the exe-XOR secret for the scene data. Scene blobs are
//! probed for the LZSS shape and passed through raw when the archive was
//! built with `--no-angou`.

use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{
    charset::{decode_utf16le, encode_cp932},
    codec::{angou, lzss, xor::xor_cycle},
    disasm,
    error::{CompileError, CompileResult, ErrorCode},
    gei,
    keys,
    linker::PackHeader,
    trace::StageTracer,
};

#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    /// Also write a `.txt` disassembly next to each `.dat`.
    pub write_disassembly: bool,
}

#[derive(Debug, Clone)]
pub struct ExtractReport {
    pub out_dir: PathBuf,
    pub scenes: usize,
    pub original_files: usize,
}

fn io_err(path: &Path, e: &std::io::Error) -> CompileError {
    CompileError::io(path.display().to_string(), e)
}

/// Strips drive letters, `..` and empty segments from an embedded name.
fn safe_relpath(name: &str) -> String {
    let mut s = name.replace('/', "\\");
    if s.len() >= 2 && s.as_bytes().get(1) == Some(&b':') {
        s = s[2..].to_owned();
    }
    s.split('\\')
        .filter(|p| !p.is_empty() && *p != "." && *p != "..")
        .collect::<Vec<_>>()
        .join("\\")
}

/// Appends `_1`, `_2`, ... before the extension until the name is free.
fn unique_outpath(dir: &Path, name: &str) -> PathBuf {
    let base = name.rsplit('\\').next().unwrap_or(name);
    let base = if base.is_empty() { "unknown.bin" } else { base };
    let mut path = dir.join(base);
    let (stem, ext) = match base.rsplit_once('.') {
        Some((s, e)) => (s.to_owned(), format!(".{e}")),
        None => (base.to_owned(), String::new()),
    };
    let mut i = 1;
    while path.exists() {
        path = dir.join(format!("{stem}_{i}{ext}"));
        i += 1;
    }
    path
}

fn read_i32_pairs(dat: &[u8], ofs: i32, cnt: i32) -> Vec<(i32, i32)> {
    let ofs = ofs as usize;
    let cnt = cnt.max(0) as usize;
    if ofs == 0 || ofs + cnt * 8 > dat.len() {
        return Vec::new();
    }
    (0..cnt)
        .map(|i| {
            let p = ofs + i * 8;
            (
                i32::from_le_bytes(dat[p..p + 4].try_into().unwrap()),
                i32::from_le_bytes(dat[p + 4..p + 8].try_into().unwrap()),
            )
        })
        .collect()
}

fn read_utf16_strings(dat: &[u8], idx: &[(i32, i32)], blob_ofs: i32) -> Vec<String> {
    let blob_ofs = blob_ofs as usize;
    idx.iter()
        .map(|&(o, l)| {
            let start = blob_ofs + o as usize * 2;
            let end = start + l as usize * 2;
            dat.get(start..end).map(decode_utf16le).unwrap_or_default()
        })
        .collect()
}

fn read_blobs(dat: &[u8], idx: &[(i32, i32)], blob_ofs: i32) -> Vec<Vec<u8>> {
    let blob_ofs = blob_ofs as usize;
    idx.iter()
        .map(|&(o, l)| {
            let start = blob_ofs + o as usize;
            let end = start + l as usize;
            dat.get(start..end).map(<[u8]>::to_vec).unwrap_or_default()
        })
        .collect()
}

/// Finds a recovered `暗号*.dat` under `dir` and derives the exe key block.
fn compute_exe_el(dir: &Path) -> Option<[u8; 16]> {
    fn find(dir: &Path, hits: &mut Vec<PathBuf>) {
        let Ok(entries) = fs::read_dir(dir) else { return };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                find(&path, hits);
            } else {
                let name = path.file_name().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
                if name.starts_with("暗号") && name.ends_with(".dat") {
                    hits.push(path);
                }
            }
        }
    }
    let mut hits = Vec::new();
    find(dir, &mut hits);
    hits.sort_by_key(|p| (p.display().to_string().len(), p.display().to_string().to_lowercase()));
    let path = hits.into_iter().next()?;
    let bytes = fs::read(path).ok()?;
    let text = crate::charset::decode_source(&bytes, None);
    let first = text.lines().next().unwrap_or("").trim_end_matches(['\r', '\n']);
    let secret = encode_cp932(first);
    (secret.len() >= 8).then(|| angou::exe_angou_element(&secret))
}

/// Decodes the original-source appendix into `out_dir`. Returns how many
/// files were written; decode problems are reported through the tracer
/// rather than failing the whole extraction.
fn extract_originals(dat: &[u8], hdr: &PackHeader, scn_data_end: usize, out_dir: &Path, tracer: &dyn StageTracer) -> usize {
    let hsz = hdr.original_source_header_size;
    if hsz <= 0 {
        return 0;
    }
    let recipe = &keys::SOURCE_ANGOU;
    let mut pos = scn_data_end;
    let Some(size_table_enc) = dat.get(pos..pos + hsz as usize) else {
        return 0;
    };
    let Ok((size_bytes, _)) = angou::source_angou_decrypt(size_table_enc, recipe) else {
        tracer.stage("OS", "size table decode failed");
        return 0;
    };
    if size_bytes.len() % 4 != 0 {
        return 0;
    }
    pos += hsz as usize;
    let mut written = 0;
    for chunk in size_bytes.chunks_exact(4) {
        let size = u32::from_le_bytes(chunk.try_into().unwrap()) as usize;
        if size == 0 || pos + size > dat.len() {
            break;
        }
        let enc = &dat[pos..pos + size];
        pos += size;
        match angou::source_angou_decrypt(enc, recipe) {
            Ok((raw, name)) => {
                let rel = safe_relpath(&name);
                let rel = if rel.is_empty() { "unknown.bin".to_owned() } else { rel };
                tracer.stage("OS", &rel);
                let path = unique_outpath(out_dir, &rel);
                if let Some(parent) = path.parent() {
                    let _ = fs::create_dir_all(parent);
                }
                if fs::write(&path, raw).is_ok() {
                    written += 1;
                }
            }
            Err(_) => {
                tracer.stage("OS", "chunk decode failed");
                break;
            }
        }
    }
    written
}

/// Extracts one archive into a fresh `output_YYYYMMDD_HHMMSS` directory.
pub fn extract_pck(
    input_pck: &Path,
    output_dir: &Path,
    opts: &ExtractOptions,
    tracer: &dyn StageTracer,
) -> CompileResult<ExtractReport> {
    let dat = fs::read(input_pck).map_err(|e| io_err(input_pck, &e))?;
    let Some(hdr) = PackHeader::parse(&dat) else {
        return Err(CompileError::new(ErrorCode::Io, input_pck.display().to_string(), 0).with_hint("header too small"));
    };
    let name_idx = read_i32_pairs(&dat, hdr.scn_name_index_list_ofs, hdr.scn_name_index_cnt);
    let mut scn_names = read_utf16_strings(&dat, &name_idx, hdr.scn_name_list_ofs);
    let data_idx = read_i32_pairs(&dat, hdr.scn_data_index_list_ofs, hdr.scn_data_index_cnt);
    let mut scn_data = read_blobs(&dat, &data_idx, hdr.scn_data_list_ofs);
    let n = scn_names.len().min(scn_data.len());
    scn_names.truncate(n);
    scn_data.truncate(n);

    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let out_dir = output_dir.join(format!("output_{stamp}"));
    fs::create_dir_all(&out_dir).map_err(|e| io_err(&out_dir, &e))?;

    let scn_data_end = hdr.scn_data_list_ofs as usize
        + data_idx.iter().map(|&(o, l)| (o + l) as usize).max().unwrap_or(0);
    let original_files = extract_originals(&dat, &hdr, scn_data_end, &out_dir, tracer);

    let exe_el = if hdr.scn_data_exe_angou_mod != 0 {
        let el = compute_exe_el(&out_dir);
        if el.is_none() {
            tracer.stage("WARN", "exe angou mode set but no 暗号*.dat recovered; scene data may stay encrypted");
        }
        el
    } else {
        None
    };

    let mut scenes = 0;
    for (name, blob) in scn_names.iter().zip(&scn_data) {
        if name.is_empty() {
            continue;
        }
        tracer.stage("EX", name);
        let blob = match &exe_el {
            Some(el) => xor_cycle(blob, el, 0),
            None => blob.clone(),
        };
        let candidate = xor_cycle(&blob, keys::EASY_ANGOU_CODE, 0);
        let out_dat = if lzss::looks_like_lzss(&candidate) {
            lzss::unpack(&candidate).unwrap_or_default()
        } else if lzss::looks_like_lzss(&blob) {
            lzss::unpack(&blob).unwrap_or_default()
        } else {
            blob
        };
        let rel = safe_relpath(&format!("{name}.dat"));
        let path = unique_outpath(&out_dir, &rel);
        fs::write(&path, &out_dat).map_err(|e| io_err(&path, &e))?;
        if opts.write_disassembly {
            let listing = disasm::disassemble_dat(&out_dat).join("\n");
            let txt_path = path.with_extension("txt");
            fs::write(&txt_path, listing).map_err(|e| io_err(&txt_path, &e))?;
        }
        scenes += 1;
    }
    Ok(ExtractReport {
        out_dir,
        scenes,
        original_files,
    })
}

/// Restores `Gameexe.ini` from a `Gameexe.dat`, deriving the exe key from
/// a `暗号*.dat` next to the input when needed.
pub fn restore_gameexe_ini(dat_path: &Path, output_dir: &Path) -> CompileResult<PathBuf> {
    let dat = fs::read(dat_path).map_err(|e| io_err(dat_path, &e))?;
    let exe_el = dat_path.parent().and_then(compute_exe_el);
    let file = dat_path.display().to_string();
    let text = gei::decode_gameexe(&dat, keys::GAMEEXE_DAT_ANGOU_CODE, exe_el.as_ref())
        .map_err(|code| CompileError::new(code, file.clone(), 0))?;
    if text.is_empty() {
        return Err(CompileError::new(ErrorCode::LzssCorrupt, file, 0).with_hint("empty payload"));
    }
    fs::create_dir_all(output_dir).map_err(|e| io_err(output_dir, &e))?;
    let out = output_dir.join("Gameexe.ini");
    fs::write(&out, text.as_bytes()).map_err(|e| io_err(&out, &e))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relpath_sanitization() {
        assert_eq!(safe_relpath("C:\\game\\scn\\a.ss"), "game\\scn\\a.ss");
        assert_eq!(safe_relpath("..\\..\\evil.ss"), "evil.ss");
        assert_eq!(safe_relpath("a/./b.ss"), "a\\b.ss");
        assert_eq!(safe_relpath(""), "");
    }

    #[test]
    fn unique_paths_never_collide() {
        let dir = tempfile::tempdir().unwrap();
        let p1 = unique_outpath(dir.path(), "x.dat");
        fs::write(&p1, b"1").unwrap();
        let p2 = unique_outpath(dir.path(), "x.dat");
        assert_ne!(p1, p2);
        assert!(p2.file_name().unwrap().to_string_lossy().contains("x_1"));
    }

    #[test]
    fn os_size_table_name_is_stable() {
        assert_eq!(crate::pipeline::OS_SIZE_TABLE_NAME, "__DummyName__");
    }
}

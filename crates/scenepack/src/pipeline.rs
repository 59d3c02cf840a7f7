//! Compilation driver: scans the project, runs IA once, pushes every
//! scene through CA->LA->SA->MA, finalizes BS serially (the string-table
//! PRNG is shared state), and hands the results to the linker.
//!
//! Front-end stages are embarrassingly parallel and run on a rayon pool
//! when requested; outputs are stitched back in sorted file-name order so
//! results never depend on scheduling.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use rayon::prelude::*;

use crate::{
    bs,
    ca,
    charset::{Charset, decode_source, encode_cp932, guess_charset_from_files},
    codec::{angou, lzss, md5_hex, xor::xor_cycle_inplace},
    error::{CompileError, CompileResult, ErrorCode},
    forms::Form,
    gei,
    ia::{IncAnalyzer, IncData},
    keys,
    la,
    linker::{self, PackInputs},
    ma,
    msvc_rand::MsvcRand,
    trace::StageTracer,
    tree::Ss,
};

/// The size-table chunk of the original-source appendix is encrypted
/// under this placeholder name.
pub const OS_SIZE_TABLE_NAME: &str = "__DummyName__";

const MAX_WORKERS: usize = 32;

/// All knobs of one compilation.
#[derive(Debug, Clone)]
pub struct Project {
    pub scn_path: PathBuf,
    pub out_path: PathBuf,
    pub scene_pck: String,
    /// Explicit tmp dir; enables the hash-based incremental cache.
    pub tmp_path: Option<PathBuf>,
    pub charset: Option<Charset>,
    pub lzss_level: u32,
    pub no_angou: bool,
    pub no_os: bool,
    pub debug: bool,
    pub parallel: bool,
    pub max_workers: Option<usize>,
    /// Overrides the secret normally read from `暗号.dat`.
    pub secret: Option<String>,
    pub gei_only: bool,
    pub gameexe_ini: String,
}

impl Project {
    pub fn new(scn_path: impl Into<PathBuf>, out_path: impl Into<PathBuf>) -> Self {
        Self {
            scn_path: scn_path.into(),
            out_path: out_path.into(),
            scene_pck: "Scene.pck".to_owned(),
            tmp_path: None,
            charset: None,
            lzss_level: 17,
            no_angou: false,
            no_os: false,
            debug: false,
            parallel: false,
            max_workers: None,
            secret: None,
            gei_only: false,
            gameexe_ini: "Gameexe.ini".to_owned(),
        }
    }
}

/// What a successful compile produced.
#[derive(Debug, Clone)]
pub struct CompileReport {
    pub scene_pck: Option<PathBuf>,
    pub gameexe_dat: PathBuf,
    pub compiled_scenes: usize,
    pub cached_scenes: usize,
}

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct Md5Cache {
    inc: BTreeMap<String, String>,
    ss: BTreeMap<String, String>,
}

fn io_err(path: &Path, e: &std::io::Error) -> CompileError {
    CompileError::io(path.display().to_string(), e)
}

fn read_bytes(path: &Path) -> CompileResult<Vec<u8>> {
    fs::read(path).map_err(|e| io_err(path, &e))
}

fn write_bytes(path: &Path, data: &[u8]) -> CompileResult<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| io_err(dir, &e))?;
    }
    // Atomic replace: write to a sibling temp file, then rename. The full
    // file name stays in the temp name so `a.ss` and `a.inc` never share
    // one when cache writers run in parallel.
    let mut tmp_name = path.file_name().map(std::ffi::OsStr::to_os_string).unwrap_or_default();
    tmp_name.push(".tmp_write");
    let tmp = path.with_file_name(tmp_name);
    fs::write(&tmp, data).map_err(|e| io_err(&tmp, &e))?;
    fs::rename(&tmp, path).map_err(|e| io_err(path, &e))
}

fn file_name(path: &Path) -> String {
    path.file_name().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default()
}

/// Directory scan: `(ini, inc, ss)` file names, sorted case-insensitively.
fn scan_dir(dir: &Path) -> CompileResult<(Vec<String>, Vec<String>, Vec<String>)> {
    let mut files: Vec<String> = Vec::new();
    let entries = fs::read_dir(dir).map_err(|e| io_err(dir, &e))?;
    for entry in entries {
        let entry = entry.map_err(|e| io_err(dir, &e))?;
        if entry.path().is_file() {
            files.push(file_name(&entry.path()));
        }
    }
    files.sort_by_key(|a| a.to_lowercase());
    let ext_is = |name: &str, ext: &str| {
        Path::new(name)
            .extension()
            .is_some_and(|e| e.to_string_lossy().eq_ignore_ascii_case(ext))
    };
    let ini = files
        .iter()
        .filter(|f| ext_is(f, "ini") || ext_is(f, "dat"))
        .cloned()
        .collect();
    let inc = files.iter().filter(|f| ext_is(f, "inc")).cloned().collect();
    let ss = files.iter().filter(|f| ext_is(f, "ss")).cloned().collect();
    Ok((ini, inc, ss))
}

fn read_source(path: &Path, charset: Option<Charset>) -> CompileResult<String> {
    let bytes = read_bytes(path)?;
    Ok(decode_source(&bytes, charset))
}

/// Reads the first line of `暗号.dat`, returning the cp932 secret bytes
/// when they meet the 8-byte minimum.
fn load_secret(project: &Project, charset: Option<Charset>) -> Option<Vec<u8>> {
    if project.no_angou {
        return None;
    }
    let text = match &project.secret {
        Some(s) => s.clone(),
        None => {
            let path = project.scn_path.join("暗号.dat");
            if !path.is_file() {
                return None;
            }
            read_source(&path, charset).ok()?
        }
    };
    let first = text.lines().next().unwrap_or("").trim_end_matches(['\r', '\n']);
    let bytes = encode_cp932(first);
    (bytes.len() >= 8).then_some(bytes)
}

/// Builds the shared IA table over all `.inc` files.
pub fn build_inc_data(
    project: &Project,
    inc_files: &[String],
    charset: Option<Charset>,
    tracer: &dyn StageTracer,
) -> CompileResult<IncData> {
    let mut data = IncData::new();
    let mut pendings = Vec::new();
    for name in inc_files {
        let path = project.scn_path.join(name);
        tracer.stage("IA", name);
        if !path.is_file() {
            return Err(CompileError::new(ErrorCode::IaMissingFile, name.clone(), 0));
        }
        let text = read_source(&path, charset)?;
        let mut ia = IncAnalyzer::new(&text, Form::Global, &mut data);
        let pending = ia
            .step1()
            .map_err(|e| CompileError::new(e.code, name.clone(), e.line).with_hint(e.hint.unwrap_or_default()))?;
        pendings.push((name.clone(), pending));
    }
    for (name, pending) in pendings {
        let mut ia = IncAnalyzer::new("", Form::Global, &mut data);
        ia.step2(pending)
            .map_err(|e| CompileError::new(e.code, name.clone(), e.line).with_hint(e.hint.unwrap_or_default()))?;
    }
    Ok(data)
}

/// Front-end result for one scene, waiting for serial BS finalization.
struct FrontOut {
    name: String,
    inc: IncData,
    lex: la::LexOutput,
    root: Ss,
    ma: ma::MaOutput,
}

fn wrap_stage(name: &str, e: crate::ia::StageError) -> CompileError {
    let mut err = CompileError::new(e.code, name.to_owned(), e.line);
    if let Some(h) = e.hint {
        err = err.with_hint(h);
    }
    err
}

fn compile_front(
    project: &Project,
    base: &IncData,
    name: &str,
    charset: Option<Charset>,
    tracer: &dyn StageTracer,
) -> CompileResult<FrontOut> {
    let path = project.scn_path.join(name);
    let text = read_source(&path, charset)?;
    let mut inc = base.clone();
    tracer.stage("CA", name);
    let expanded = ca::analyze_file(&text, &mut inc).map_err(|e| wrap_stage(name, e))?;
    tracer.stage("LA", name);
    let mut lex = la::analyze(&expanded).map_err(|e| wrap_stage(name, e))?;
    tracer.stage("SA", name);
    let mut root = crate::sa::analyze(&mut inc, &lex).map_err(|e| wrap_stage(name, e))?;
    tracer.stage("MA", name);
    let ma = ma::analyze(&mut inc, &mut lex, &mut root).map_err(|e| wrap_stage(name, e))?;
    Ok(FrontOut {
        name: name.to_owned(),
        inc,
        lex,
        root,
        ma,
    })
}

fn worker_count(project: &Project) -> usize {
    project
        .max_workers
        .filter(|&n| n > 0)
        .unwrap_or_else(|| std::thread::available_parallelism().map_or(4, |n| n.get()))
        .min(MAX_WORKERS)
}

/// Compiles `compile_list` scenes into `tmp/bs/<name>.dat`.
///
/// Front stages may run in parallel; the BS string-table pass runs
/// serially in sorted order so the PRNG stream matches a serial build.
fn compile_scenes(
    project: &Project,
    inc: &IncData,
    compile_list: &[String],
    charset: Option<Charset>,
    tmp: &Path,
    tracer: &dyn StageTracer,
) -> CompileResult<()> {
    let fronts: Vec<CompileResult<FrontOut>> = if project.parallel && compile_list.len() > 1 {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(worker_count(project))
            .build()
            .map_err(|e| CompileError::new(ErrorCode::UnkError, "rayon", 0).with_hint(e.to_string()))?;
        pool.install(|| {
            compile_list
                .par_iter()
                .map(|name| compile_front(project, inc, name, charset, tracer))
                .collect()
        })
    } else {
        compile_list
            .iter()
            .map(|name| compile_front(project, inc, name, charset, tracer))
            .collect()
    };
    // compile_list is sorted, so the first Err is the earliest by file.
    let mut outs = Vec::with_capacity(fronts.len());
    for front in fronts {
        outs.push(front?);
    }
    let mut rng = MsvcRand::new(1);
    for out in &outs {
        tracer.stage("BS", &out.name);
        let dat = bs::compile(&out.inc, &out.lex, &out.root, &out.ma, &mut rng)
            .map_err(|e| CompileError::new(e.code, out.name.clone(), e.line))?;
        let stem = linker::scene_name(&out.name);
        write_bytes(&tmp.join("bs").join(format!("{stem}.dat")), &dat)?;
    }
    Ok(())
}

/// Collects the original-source file list relative to the project root:
/// `Gameexe*.ini`, `暗号*.dat`, `*.inc`, `*.ss`, each group recursive and
/// sorted, paths rendered with backslashes.
fn original_source_rel_list(root: &Path) -> Vec<String> {
    fn walk(dir: &Path, root: &Path, out: &mut Vec<(String, PathBuf)>) {
        let Ok(entries) = fs::read_dir(dir) else { return };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                walk(&path, root, out);
            } else if let Ok(rel) = path.strip_prefix(root) {
                let rel_win = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("\\");
                out.push((rel_win, path));
            }
        }
    }
    let mut files = Vec::new();
    walk(root, root, &mut files);
    let mut groups: [Vec<String>; 4] = Default::default();
    for (rel, path) in files {
        let name = file_name(&path).to_lowercase();
        if name.starts_with("gameexe") && name.ends_with(".ini") {
            groups[0].push(rel);
        } else if name.starts_with("暗号") && name.ends_with(".dat") {
            groups[1].push(rel);
        } else if name.ends_with(".inc") {
            groups[2].push(rel);
        } else if name.ends_with(".ss") {
            groups[3].push(rel);
        }
    }
    for g in &mut groups {
        g.sort_by_key(|a| a.to_lowercase());
    }
    groups.into_iter().flatten().collect()
}

/// Encrypts the original-source appendix, reusing mtime-valid cache files
/// under `tmp/os/`.
fn build_original_chunks(
    project: &Project,
    tmp: &Path,
    tracer: &dyn StageTracer,
) -> CompileResult<(i32, Vec<Vec<u8>>)> {
    if project.no_angou {
        return Ok((0, Vec::new()));
    }
    let rel_list = original_source_rel_list(&project.scn_path);
    if rel_list.is_empty() {
        return Ok((0, Vec::new()));
    }
    let recipe = &keys::SOURCE_ANGOU;
    let encrypt_one = |rel: &String| -> CompileResult<Vec<u8>> {
        let src = project.scn_path.join(rel.replace('\\', std::path::MAIN_SEPARATOR_STR));
        let cache = tmp.join("os").join(rel.replace('\\', std::path::MAIN_SEPARATOR_STR));
        let fresh = match (fs::metadata(&cache), fs::metadata(&src)) {
            (Ok(c), Ok(s)) => match (c.modified(), s.modified()) {
                (Ok(cm), Ok(sm)) => cm >= sm,
                _ => false,
            },
            _ => false,
        };
        if fresh {
            return read_bytes(&cache);
        }
        tracer.stage("OS", rel);
        let raw = read_bytes(&src)?;
        let enc = angou::source_angou_encrypt(&raw, rel, recipe, project.lzss_level);
        write_bytes(&cache, &enc)?;
        Ok(enc)
    };
    let chunks: Vec<CompileResult<Vec<u8>>> = if project.parallel && rel_list.len() > 1 {
        rel_list.par_iter().map(encrypt_one).collect()
    } else {
        rel_list.iter().map(encrypt_one).collect()
    };
    let mut sizes = Vec::with_capacity(chunks.len());
    let mut blobs = Vec::with_capacity(chunks.len());
    for c in chunks {
        let c = c?;
        sizes.push(c.len() as u32);
        blobs.push(c);
    }
    let mut size_bytes = Vec::with_capacity(sizes.len() * 4);
    for s in &sizes {
        size_bytes.extend_from_slice(&s.to_le_bytes());
    }
    let size_table = angou::source_angou_encrypt(&size_bytes, OS_SIZE_TABLE_NAME, recipe, project.lzss_level);
    let header_size = size_table.len() as i32;
    if project.no_os {
        // The header still records the size-table length, but no appendix
        // bytes are emitted.
        return Ok((header_size, Vec::new()));
    }
    let mut all = vec![size_table];
    all.extend(blobs);
    Ok((header_size, all))
}

/// Full `compile` entry point.
pub fn compile(project: &Project, tracer: &dyn StageTracer) -> CompileResult<CompileReport> {
    if !project.scn_path.is_dir() {
        return Err(CompileError::new(ErrorCode::Io, project.scn_path.display().to_string(), 0).with_hint("input_dir not found"));
    }
    fs::create_dir_all(&project.out_path).map_err(|e| io_err(&project.out_path, &e))?;
    let (ini, inc_files, ss_files) = scan_dir(&project.scn_path)?;
    let charset = project.charset.or_else(|| {
        let mut probe: Vec<PathBuf> = ss_files.iter().map(|f| project.scn_path.join(f)).collect();
        probe.extend(inc_files.iter().map(|f| project.scn_path.join(f)));
        probe.extend(ini.iter().map(|f| project.scn_path.join(f)));
        Some(guess_charset_from_files(&probe))
    });

    let secret = load_secret(project, charset);
    let exe_el = secret.as_deref().map(angou::exe_angou_element);

    // Gameexe.dat is written unconditionally, even from an empty ini.
    let gei_path = project.scn_path.join(&project.gameexe_ini);
    let ini_text = if gei_path.is_file() {
        read_source(&gei_path, charset)?
    } else {
        String::new()
    };
    let sanitized = gei::sanitize_ini(&ini_text)
        .map_err(|e| CompileError::new(e.code, project.gameexe_ini.clone(), e.line).with_hint(e.hint.unwrap_or_default()))?;
    let dat = gei::encode_gameexe(&sanitized, keys::GAMEEXE_DAT_ANGOU_CODE, exe_el.as_ref(), project.lzss_level);
    let gameexe_out = project.out_path.join("Gameexe.dat");
    tracer.stage("GEI", &project.gameexe_ini);
    write_bytes(&gameexe_out, dat.keyed.as_deref().unwrap_or(&dat.plain))?;
    if project.gei_only {
        return Ok(CompileReport {
            scene_pck: None,
            gameexe_dat: gameexe_out,
            compiled_scenes: 0,
            cached_scenes: 0,
        });
    }

    // Tmp dir: explicit enables caching, otherwise a fresh timestamped dir.
    let (tmp, auto_tmp) = match &project.tmp_path {
        Some(t) => (t.clone(), false),
        None => {
            let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
            (project.out_path.join(format!("tmp_{stamp}")), true)
        }
    };
    fs::create_dir_all(&tmp).map_err(|e| io_err(&tmp, &e))?;
    if let Some(el) = &exe_el {
        let header = gei::exe_angou_header(el);
        write_bytes(&tmp.join("EXE_ANGOU.h"), &encode_cp932(&header))?;
    }

    // Incremental cache: inc changes force a full rebuild and purge every
    // cached .lzss; otherwise only stale scenes recompile.
    let bs_dir = tmp.join("bs");
    let cache_path = project.tmp_path.as_ref().map(|_| tmp.join("_md5.json"));
    let mut current = Md5Cache::default();
    let mut compile_list: Vec<String> = ss_files.clone();
    if let Some(cache_path) = &cache_path {
        for f in &inc_files {
            let bytes = read_bytes(&project.scn_path.join(f))?;
            current.inc.insert(f.to_lowercase(), md5_hex(&bytes));
        }
        for f in &ss_files {
            let bytes = read_bytes(&project.scn_path.join(f))?;
            current.ss.insert(f.to_lowercase(), md5_hex(&bytes));
        }
        let old: Option<Md5Cache> = fs::read(cache_path)
            .ok()
            .and_then(|b| serde_json::from_slice(&b).ok());
        let full = match &old {
            None => true,
            Some(old) => old.inc != current.inc,
        };
        if full {
            if !project.no_angou && bs_dir.is_dir() {
                purge_ext(&bs_dir, "lzss");
            }
        } else {
            let old_ss = &old.as_ref().unwrap().ss;
            compile_list = ss_files
                .iter()
                .filter(|f| {
                    let stem = linker::scene_name(f);
                    let dat = bs_dir.join(format!("{stem}.dat"));
                    let lz = bs_dir.join(format!("{stem}.lzss"));
                    let key = f.to_lowercase();
                    !dat.is_file()
                        || (!project.no_angou && !lz.is_file())
                        || old_ss.get(&key) != current.ss.get(&key)
                })
                .cloned()
                .collect();
            for f in &compile_list {
                let lz = bs_dir.join(format!("{}.lzss", linker::scene_name(f)));
                let _ = fs::remove_file(lz);
            }
        }
    }

    let inc_data = build_inc_data(project, &inc_files, charset, tracer)?;
    compile_scenes(project, &inc_data, &compile_list, charset, &tmp, tracer)?;

    // Link.
    let scn_names: Vec<String> = ss_files.iter().map(|f| linker::scene_name(f)).collect();
    let mut dat_list = Vec::with_capacity(scn_names.len());
    for name in &scn_names {
        let path = bs_dir.join(format!("{name}.dat"));
        if !path.is_file() {
            return Err(CompileError::new(ErrorCode::LinkMissingScene, name.clone(), 0));
        }
        dat_list.push(read_bytes(&path)?);
    }
    let inc_cmd_list = linker::resolve_inc_cmd_list(&inc_data, &dat_list)?;
    let inc_cmd_list = &inc_cmd_list[..inc_data.inc_command_cnt.min(inc_cmd_list.len())];
    let scene_blobs: Vec<Vec<u8>> = if project.no_angou {
        dat_list.clone()
    } else {
        let compress = |(name, dat): (&String, &Vec<u8>)| -> CompileResult<Vec<u8>> {
            let lz_path = bs_dir.join(format!("{name}.lzss"));
            if lz_path.is_file() {
                return read_bytes(&lz_path);
            }
            tracer.stage("LZSS", name);
            let mut lz = lzss::pack_level(dat, project.lzss_level);
            xor_cycle_inplace(&mut lz, keys::EASY_ANGOU_CODE, 0);
            write_bytes(&lz_path, &lz)?;
            Ok(lz)
        };
        let compressed: Vec<CompileResult<Vec<u8>>> = if project.parallel && scn_names.len() > 1 {
            scn_names.par_iter().zip(dat_list.par_iter()).map(compress).collect()
        } else {
            scn_names.iter().zip(dat_list.iter()).map(compress).collect()
        };
        let mut out = Vec::with_capacity(compressed.len());
        for c in compressed {
            out.push(c?);
        }
        out
    };

    let (original_hsz, original_chunks) = build_original_chunks(project, &tmp, tracer)?;
    let inc_props = linker::inc_props(&inc_data);
    let inc_prop_names: Vec<String> = inc_props.iter().map(|p| p.name.clone()).collect();
    let inc_cmd_names: Vec<String> = inc_data.command_list[..inc_data.inc_command_cnt]
        .iter()
        .map(|c| c.name.clone())
        .collect();

    let final_blobs;
    let exe_mod;
    if let Some(el) = &exe_el {
        final_blobs = linker::apply_exe_layer(&scene_blobs, el);
        exe_mod = 1;
    } else {
        final_blobs = scene_blobs;
        exe_mod = 0;
    }
    let pack = linker::build_pack_bytes(&PackInputs {
        inc_props,
        inc_prop_names: &inc_prop_names,
        inc_cmd_names: &inc_cmd_names,
        inc_cmd_list,
        scn_name_list: &scn_names,
        scn_data_list: &final_blobs,
        scn_data_exe_angou_mod: exe_mod,
        original_source_header_size: original_hsz,
        original_chunks: &original_chunks,
    });
    let pck_path = project.out_path.join(&project.scene_pck);
    write_bytes(&pck_path, &pack)?;

    if let Some(cache_path) = &cache_path {
        let json = serde_json::to_vec_pretty(&current)
            .map_err(|e| CompileError::new(ErrorCode::Io, "_md5.json", 0).with_hint(e.to_string()))?;
        write_bytes(cache_path, &json)?;
    }
    if auto_tmp && !project.debug {
        let _ = fs::remove_dir_all(&tmp);
    }
    Ok(CompileReport {
        scene_pck: Some(pck_path),
        gameexe_dat: gameexe_out,
        compiled_scenes: compile_list.len(),
        cached_scenes: ss_files.len() - compile_list.len(),
    })
}

fn purge_ext(dir: &Path, ext: &str) {
    let Ok(entries) = fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        if path
            .extension()
            .is_some_and(|e| e.to_string_lossy().eq_ignore_ascii_case(ext))
        {
            let _ = fs::remove_file(path);
        }
    }
}

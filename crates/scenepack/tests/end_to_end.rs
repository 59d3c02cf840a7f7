//! End-to-end scenarios over real project directories: compile, link,
//! extract, and the round-trip laws between them.

use std::{fs, path::Path};

use pretty_assertions::assert_eq;
use scenepack::{
    ExtractOptions, NoopTracer, Project, bs::ScnHeader, compile, extract_pck, gei, keys,
    linker::PackHeader, restore_gameexe_ini,
};

fn write(dir: &Path, name: &str, content: &str) {
    fs::write(dir.join(name), content).unwrap();
}

fn minimal_project(dir: &Path) {
    write(dir, "hello.ss", "\n*z0\n\"hi\"\n");
    write(dir, "Gameexe.ini", "#title = \"demo\"\n");
}

fn project(dir: &Path, out: &Path) -> Project {
    let mut p = Project::new(dir, out);
    p.no_angou = true;
    p
}

fn read_pack(out: &Path) -> Vec<u8> {
    fs::read(out.join("Scene.pck")).unwrap()
}

fn scene_blobs(pack: &[u8]) -> Vec<Vec<u8>> {
    let h = PackHeader::parse(pack).unwrap();
    let idx_ofs = h.scn_data_index_list_ofs as usize;
    (0..h.scn_data_index_cnt as usize)
        .map(|i| {
            let p = idx_ofs + i * 8;
            let o = i32::from_le_bytes(pack[p..p + 4].try_into().unwrap()) as usize;
            let l = i32::from_le_bytes(pack[p + 4..p + 8].try_into().unwrap()) as usize;
            let base = h.scn_data_list_ofs as usize + o;
            pack[base..base + l].to_vec()
        })
        .collect()
}

#[test]
fn minimal_scene_compiles_into_an_archive() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    let out = tmp.path().join("out");
    fs::create_dir_all(&src).unwrap();
    minimal_project(&src);

    let report = compile(&project(&src, &out), &NoopTracer).unwrap();
    assert_eq!(report.compiled_scenes, 1);
    let pack = read_pack(&out);
    let h = PackHeader::parse(&pack).unwrap();
    assert_eq!(h.scn_name_cnt, 1);
    assert_eq!(h.scn_data_cnt, 1);
    assert_eq!(h.scn_data_index_cnt, 1);
    assert_eq!(h.scn_data_exe_angou_mod, 0);
    assert_eq!(h.original_source_header_size, 0);

    // --no-angou stores the per-scene image verbatim.
    let blobs = scene_blobs(&pack);
    let sh = ScnHeader::parse(&blobs[0]).unwrap();
    assert_eq!(sh.header_size, 132);
    assert_eq!(sh.str_cnt, 1);
    let strings = scenepack::bs::decode_str_table(&blobs[0], &sh);
    assert_eq!(strings, vec!["hi"]);
    // z0 exists and points inside the bytecode.
    let z0 = i32::from_le_bytes(blobs[0][sh.z_label_list_ofs as usize..][..4].try_into().unwrap());
    assert!(z0 > 0 && z0 < sh.scn_size);
}

#[test]
fn include_visible_command_lands_in_the_archive() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    let out = tmp.path().join("out");
    fs::create_dir_all(&src).unwrap();
    write(&src, "a.inc", "#command foo(int): int\n");
    write(
        &src,
        "a.ss",
        "*z0\ncommand foo(property x: int): int { return(x) }\nf[0] = foo(1)\n",
    );
    write(&src, "Gameexe.ini", "");

    compile(&project(&src, &out), &NoopTracer).unwrap();
    let pack = read_pack(&out);
    let h = PackHeader::parse(&pack).unwrap();
    assert_eq!(h.inc_cmd_cnt, 1);
    let p = h.inc_cmd_list_ofs as usize;
    let scene_no = i32::from_le_bytes(pack[p..p + 4].try_into().unwrap());
    let offset = i32::from_le_bytes(pack[p + 4..p + 8].try_into().unwrap());
    assert_eq!(scene_no, 0);
    assert!(offset > 0);
    // The command name is recorded in UTF-16.
    let name_idx = h.inc_cmd_name_index_list_ofs as usize;
    let len = i32::from_le_bytes(pack[name_idx + 4..name_idx + 8].try_into().unwrap());
    assert_eq!(len, 3);
}

#[test]
fn duplicate_command_definitions_fail_at_link() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    let out = tmp.path().join("out");
    fs::create_dir_all(&src).unwrap();
    write(&src, "a.inc", "#command foo(int): int\n");
    write(&src, "a.ss", "*z0\ncommand foo(property x: int): int { return(x) }\n");
    write(&src, "b.ss", "*z0\ncommand foo(property x: int): int { return(x) }\n");

    let err = compile(&project(&src, &out), &NoopTracer).unwrap_err();
    assert_eq!(err.code, scenepack::ErrorCode::LinkCmdMultiplyDefined);
}

#[test]
fn missing_command_definition_fails_at_link() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    let out = tmp.path().join("out");
    fs::create_dir_all(&src).unwrap();
    write(&src, "a.inc", "#command ghost(int): int\n");
    write(&src, "a.ss", "*z0\ncommand other() { \"x\" }\n");

    let err = compile(&project(&src, &out), &NoopTracer).unwrap_err();
    assert_eq!(err.code, scenepack::ErrorCode::LinkCmdNotDefined);
}

#[test]
fn two_runs_produce_identical_bytes() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    fs::create_dir_all(&src).unwrap();
    write(&src, "a.ss", "*z0\n\"line a\"\nf[0] = 1\n");
    write(&src, "b.ss", "*z0\n\"line b\"\nkoe(100)\n");
    write(&src, "Gameexe.ini", "#cap = 2\n");
    write(&src, "暗号.dat", "password\n");

    let out1 = tmp.path().join("out1");
    let out2 = tmp.path().join("out2");
    compile(&Project::new(&src, &out1), &NoopTracer).unwrap();
    compile(&Project::new(&src, &out2), &NoopTracer).unwrap();
    assert_eq!(read_pack(&out1), read_pack(&out2));
    assert_eq!(
        fs::read(out1.join("Gameexe.dat")).unwrap(),
        fs::read(out2.join("Gameexe.dat")).unwrap()
    );
}

#[test]
fn keyed_archive_roundtrips_through_extract_and_recompile() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    fs::create_dir_all(&src).unwrap();
    write(&src, "common.inc", "#command greet(str): int\n");
    write(
        &src,
        "a.ss",
        "*z0\ncommand greet(property who: str): int { \u{3010}\"sys\"\u{3011} \"hello\" return(1) }\nf[0] = greet(\"you\")\n\"done\"\n",
    );
    write(&src, "b.ss", "*z0\n*top\nf[1] += 1\nif (f[1] < 3) { goto *top }\n\"b end\"\n");
    write(&src, "Gameexe.ini", "#name = \"roundtrip\"\n");
    write(&src, "暗号.dat", "password\n");

    let out1 = tmp.path().join("out1");
    let report = compile(&Project::new(&src, &out1), &NoopTracer).unwrap();
    assert_eq!(report.compiled_scenes, 2);
    let pack1 = read_pack(&out1);
    let h = PackHeader::parse(&pack1).unwrap();
    assert_eq!(h.scn_data_exe_angou_mod, 1);
    assert!(h.original_source_header_size > 0);
    // Gameexe.dat carries the keyed mode flag.
    let ge1 = fs::read(out1.join("Gameexe.dat")).unwrap();
    assert_eq!(i32::from_le_bytes(ge1[4..8].try_into().unwrap()), 1);

    // Extract recovers the original sources (flat), including the key
    // file, and descrambles the per-scene images.
    let ex_dir = tmp.path().join("extracted");
    let report = extract_pck(&out1.join("Scene.pck"), &ex_dir, &ExtractOptions::default(), &NoopTracer).unwrap();
    assert_eq!(report.scenes, 2);
    // Gameexe.ini + 暗号.dat + common.inc + two scene sources.
    assert_eq!(report.original_files, 5);
    let recovered = &report.out_dir;
    assert_eq!(
        fs::read(recovered.join("a.ss")).unwrap(),
        fs::read(src.join("a.ss")).unwrap()
    );
    assert_eq!(
        fs::read(recovered.join("暗号.dat")).unwrap(),
        fs::read(src.join("暗号.dat")).unwrap()
    );
    // Extracted .dat images parse as plain scene images.
    let a_dat = fs::read(recovered.join("a.dat")).unwrap();
    assert!(ScnHeader::parse(&a_dat).is_some());

    // Recompiling the recovered sources reproduces both outputs
    // byte-for-byte.
    let out2 = tmp.path().join("out2");
    compile(&Project::new(recovered, &out2), &NoopTracer).unwrap();
    assert_eq!(pack1, read_pack(&out2));
    assert_eq!(ge1, fs::read(out2.join("Gameexe.dat")).unwrap());
}

#[test]
fn gameexe_dat_restores_to_the_sanitized_ini() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    let out = tmp.path().join("out");
    fs::create_dir_all(&src).unwrap();
    write(&src, "a.ss", "*z0\n\"x\"\n");
    write(&src, "Gameexe.ini", "#width = 1280 ; comment\n#name = \"Game\"\n");

    let mut p = project(&src, &out);
    p.gei_only = true;
    compile(&p, &NoopTracer).unwrap();
    let restored_dir = tmp.path().join("restored");
    let path = restore_gameexe_ini(&out.join("Gameexe.dat"), &restored_dir).unwrap();
    let text = fs::read_to_string(path).unwrap();
    let expected = gei::sanitize_ini("#width = 1280 ; comment\n#name = \"Game\"\n").unwrap();
    assert_eq!(text, expected);
    assert!(text.contains("#WIDTH = 1280"));
    assert!(text.contains("\"Game\""));
}

#[test]
fn incremental_cache_recompiles_only_stale_scenes() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    let out = tmp.path().join("out");
    let cache = tmp.path().join("cache");
    fs::create_dir_all(&src).unwrap();
    write(&src, "shared.inc", "#property hp: int\n");
    write(&src, "a.ss", "*z0\n\"a\"\n");
    write(&src, "b.ss", "*z0\n\"b\"\n");
    write(&src, "Gameexe.ini", "");

    let mut p = Project::new(&src, &out);
    p.tmp_path = Some(cache.clone());
    let report = compile(&p, &NoopTracer).unwrap();
    assert_eq!(report.compiled_scenes, 2);
    assert!(cache.join("_md5.json").is_file());
    let b_dat_before = fs::read(cache.join("bs/b.dat")).unwrap();

    // Touching one scene recompiles only that scene.
    write(&src, "a.ss", "*z0\n\"a changed\"\n");
    let report = compile(&p, &NoopTracer).unwrap();
    assert_eq!(report.compiled_scenes, 1);
    assert_eq!(report.cached_scenes, 1);
    assert_eq!(fs::read(cache.join("bs/b.dat")).unwrap(), b_dat_before);

    // An inc change invalidates everything.
    write(&src, "shared.inc", "#property hp: int\n#property mp: int\n");
    let report = compile(&p, &NoopTracer).unwrap();
    assert_eq!(report.compiled_scenes, 2);
}

#[test]
fn parallel_and_serial_builds_agree() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    fs::create_dir_all(&src).unwrap();
    for i in 0..5 {
        write(
            &src,
            &format!("scene{i}.ss"),
            &format!("*z0\n\"scene number {i}\"\nf[{i}] = {i}\n"),
        );
    }
    write(&src, "Gameexe.ini", "");

    let out_serial = tmp.path().join("serial");
    let out_parallel = tmp.path().join("parallel");
    let mut serial = Project::new(&src, &out_serial);
    serial.no_angou = true;
    let mut parallel = Project::new(&src, &out_parallel);
    parallel.no_angou = true;
    parallel.parallel = true;
    parallel.max_workers = Some(4);
    compile(&serial, &NoopTracer).unwrap();
    compile(&parallel, &NoopTracer).unwrap();
    assert_eq!(read_pack(&out_serial), read_pack(&out_parallel));
}

#[test]
fn compile_errors_carry_file_and_line() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    let out = tmp.path().join("out");
    fs::create_dir_all(&src).unwrap();
    write(&src, "bad.ss", "*z0\nf[0] = \"nope\"\n");

    let err = compile(&project(&src, &out), &NoopTracer).unwrap_err();
    assert_eq!(err.code, scenepack::ErrorCode::MaAssignTypeNoMatch);
    assert_eq!(err.file, "bad.ss");
    assert_eq!(err.line, 2);
    assert!(err.to_string().contains("MA_ASSIGN_TYPE_NO_MATCH at bad.ss:2"));
}

#[test]
fn no_angou_and_keyed_bodies_differ_only_by_layers() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    fs::create_dir_all(&src).unwrap();
    write(&src, "a.ss", "*z0\n\"the same scene\"\n");
    write(&src, "暗号.dat", "password\n");
    write(&src, "Gameexe.ini", "");

    let out_plain = tmp.path().join("plain");
    let mut plain = Project::new(&src, &out_plain);
    plain.no_angou = true;
    compile(&plain, &NoopTracer).unwrap();
    let raw_dat = scene_blobs(&read_pack(&out_plain)).remove(0);

    let out_keyed = tmp.path().join("keyed");
    compile(&Project::new(&src, &out_keyed), &NoopTracer).unwrap();
    let keyed_blob = scene_blobs(&read_pack(&out_keyed)).remove(0);

    // Peel exe-XOR, easy-XOR and LZSS by hand: the plain image appears.
    let el = scenepack::codec::angou::exe_angou_element(&scenepack::charset::encode_cp932("password"));
    let without_exe = scenepack::codec::xor::xor_cycle(&keyed_blob, &el, 0);
    let without_easy = scenepack::codec::xor::xor_cycle(&without_exe, keys::EASY_ANGOU_CODE, 0);
    let unpacked = scenepack::codec::lzss::unpack(&without_easy).unwrap();
    assert_eq!(unpacked, raw_dat);
}

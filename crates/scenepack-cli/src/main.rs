use std::{env, path::PathBuf, process::ExitCode};

use scenepack::{
    Charset, ExtractOptions, Project, StderrTracer, charset::normalize_charset, compile, extract_pck,
    restore_gameexe_ini,
};

fn usage(prog: &str) {
    eprintln!("usage: {prog} <compile|extract> [options] <input> <output>");
    eprintln!();
    eprintln!("Compile mode:");
    eprintln!("  {prog} compile [--debug] [--charset ENC] [--no-os] [--no-angou] [--tmp <dir>]");
    eprintln!("                 [--parallel] [--max-workers N] [--lzss-level 2..17] <input_dir> <output>");
    eprintln!("  {prog} compile --gei <input_dir|Gameexe.ini> <output_dir>");
    eprintln!();
    eprintln!("Extract mode:");
    eprintln!("  {prog} extract [--dat-txt] <input_pck> <output_dir>");
    eprintln!("  {prog} extract --gei <Gameexe.dat> <output_dir>");
}

fn usage_short(prog: &str) {
    eprintln!("usage: {prog} <compile|extract> [options] <input> <output>");
    eprintln!("Try '{prog} --help' for more information.");
}

struct Flags {
    charset: Option<Charset>,
    tmp: Option<PathBuf>,
    debug: bool,
    no_os: bool,
    no_angou: bool,
    parallel: bool,
    max_workers: Option<usize>,
    lzss_level: u32,
    gei: bool,
    dat_txt: bool,
    positional: Vec<String>,
}

fn parse_flags(prog: &str, args: &[String]) -> Result<Flags, ExitCode> {
    let mut flags = Flags {
        charset: None,
        tmp: None,
        debug: false,
        no_os: false,
        no_angou: false,
        parallel: false,
        max_workers: None,
        lzss_level: 17,
        gei: false,
        dat_txt: false,
        positional: Vec::new(),
    };
    let mut i = 0;
    while i < args.len() {
        let a = &args[i];
        match a.as_str() {
            "--debug" => flags.debug = true,
            "--no-os" => flags.no_os = true,
            "--no-angou" => flags.no_angou = true,
            "--parallel" => flags.parallel = true,
            "--gei" => flags.gei = true,
            "--dat-txt" => flags.dat_txt = true,
            "--charset" => {
                i += 1;
                let Some(v) = args.get(i) else {
                    eprintln!("--charset needs a value");
                    return Err(ExitCode::from(2));
                };
                let Some(cs) = normalize_charset(v) else {
                    eprintln!("unknown charset: {v}");
                    return Err(ExitCode::from(2));
                };
                flags.charset = Some(cs);
            }
            "--tmp" => {
                i += 1;
                let Some(v) = args.get(i) else {
                    eprintln!("--tmp needs a value");
                    return Err(ExitCode::from(2));
                };
                flags.tmp = Some(PathBuf::from(v));
            }
            "--max-workers" => {
                i += 1;
                let Some(n) = args.get(i).and_then(|v| v.parse::<usize>().ok()) else {
                    eprintln!("--max-workers needs a number");
                    return Err(ExitCode::from(2));
                };
                flags.max_workers = Some(n);
            }
            "--lzss-level" => {
                i += 1;
                let Some(n) = args.get(i).and_then(|v| v.parse::<u32>().ok()) else {
                    eprintln!("--lzss-level needs a number");
                    return Err(ExitCode::from(2));
                };
                if !(2..=17).contains(&n) {
                    eprintln!("--lzss-level must be 2..17");
                    return Err(ExitCode::from(2));
                }
                flags.lzss_level = n;
            }
            "-h" | "--help" | "help" => {
                usage(prog);
                return Err(ExitCode::SUCCESS);
            }
            _ if a.starts_with('-') => {
                eprintln!("unknown option: {a}");
                usage_short(prog);
                return Err(ExitCode::from(2));
            }
            _ => flags.positional.push(a.clone()),
        }
        i += 1;
    }
    Ok(flags)
}

fn run_compile(prog: &str, flags: Flags) -> ExitCode {
    if flags.positional.len() != 2 {
        usage_short(prog);
        return ExitCode::from(2);
    }
    let mut input = PathBuf::from(&flags.positional[0]);
    let output = PathBuf::from(&flags.positional[1]);
    let mut gameexe_ini = "Gameexe.ini".to_owned();
    if flags.gei && input.is_file() {
        gameexe_ini = input
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or(gameexe_ini);
        input = match input.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
    }
    // An output ending in a file name selects the archive name; a
    // directory keeps the default Scene.pck.
    let (out_dir, scene_pck) = if output.is_dir() || flags.positional[1].ends_with(std::path::MAIN_SEPARATOR) {
        (output, "Scene.pck".to_owned())
    } else if output.extension().is_some() {
        let name = output
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "Scene.pck".to_owned());
        (output.parent().map_or_else(|| PathBuf::from("."), PathBuf::from), name)
    } else {
        (output, "Scene.pck".to_owned())
    };
    let mut project = Project::new(input, out_dir);
    project.scene_pck = scene_pck;
    project.tmp_path = flags.tmp;
    project.charset = flags.charset;
    project.lzss_level = flags.lzss_level;
    project.no_angou = flags.no_angou;
    project.no_os = flags.no_os;
    project.debug = flags.debug;
    project.parallel = flags.parallel;
    project.max_workers = flags.max_workers;
    project.gei_only = flags.gei;
    project.gameexe_ini = gameexe_ini;
    match compile(&project, &StderrTracer) {
        Ok(report) => {
            if let Some(pck) = &report.scene_pck {
                println!("Wrote: {}", pck.display());
            }
            println!("Wrote: {}", report.gameexe_dat.display());
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run_extract(prog: &str, flags: Flags) -> ExitCode {
    if flags.positional.len() != 2 {
        usage_short(prog);
        return ExitCode::from(2);
    }
    let input = PathBuf::from(&flags.positional[0]);
    let output = PathBuf::from(&flags.positional[1]);
    if flags.gei {
        if flags.dat_txt {
            eprintln!("--dat-txt is not supported with --gei");
            return ExitCode::from(2);
        }
        return match restore_gameexe_ini(&input, &output) {
            Ok(path) => {
                println!("Wrote: {}", path.display());
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("{err}");
                ExitCode::FAILURE
            }
        };
    }
    let opts = ExtractOptions {
        write_disassembly: flags.dat_txt,
    };
    match extract_pck(&input, &output, &opts, &StderrTracer) {
        Ok(report) => {
            println!("Output: {}", report.out_dir.display());
            println!("Extracted scenes: {}", report.scenes);
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let prog = args
        .first()
        .map(|p| {
            PathBuf::from(p)
                .file_name()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "scenepack".to_owned())
        })
        .unwrap_or_else(|| "scenepack".to_owned());
    let Some(mode) = args.get(1) else {
        usage(&prog);
        return ExitCode::SUCCESS;
    };
    match mode.as_str() {
        "-h" | "--help" | "help" => {
            usage(&prog);
            ExitCode::SUCCESS
        }
        "compile" | "-c" | "--compile" => match parse_flags(&prog, &args[2..]) {
            Ok(flags) => run_compile(&prog, flags),
            Err(code) => code,
        },
        "extract" | "-x" | "--extract" => match parse_flags(&prog, &args[2..]) {
            Ok(flags) => run_extract(&prog, flags),
            Err(code) => code,
        },
        other => {
            eprintln!("{prog}: unknown mode: {other}");
            usage_short(&prog);
            ExitCode::from(2)
        }
    }
}

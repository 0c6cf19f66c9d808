//! Deterministic fake compiler subprocess used by the integration tests in `tests/`.
//!
//! Behavior is driven entirely by directive lines in the source file it is pointed at, so a
//! test can provoke any compiler-contract outcome (success, warnings, failure, a version
//! bump, declared install-dependencies) just by writing that file. Recognized directives, one
//! per line:
//!
//! - `exit=<code>` — exit with `<code>` instead of running the normal `-compile`/`-info` path.
//! - `version=<n>` — compiler version to report/stamp (defaults to 1).
//! - `dep=<type:data://path>` — an install-dependency to declare (repeatable).
//!
//! Never built as part of the real server; gated behind the `test-fixtures` feature.

use std::{fs, path::PathBuf, process::ExitCode};

use resource_build_server::{header::ResourceHeader, id::ResourceId};

struct Directives {
    exit: Option<i32>,
    version: i32,
    deps: Vec<ResourceId>,
}

fn parse_directives(source_path: &PathBuf) -> Directives {
    let mut directives = Directives { exit: None, version: 1, deps: Vec::new() };
    let Ok(text) = fs::read_to_string(source_path) else { return directives };
    for line in text.lines() {
        let line = line.trim();
        if let Some(value) = line.strip_prefix("exit=") {
            directives.exit = value.trim().parse().ok();
        } else if let Some(value) = line.strip_prefix("version=") {
            if let Ok(v) = value.trim().parse() {
                directives.version = v;
            }
        } else if let Some(value) = line.strip_prefix("dep=") {
            if let Ok(id) = value.trim().parse::<ResourceId>() {
                directives.deps.push(id);
            }
        }
    }
    directives
}

fn arg_value<'a>(args: &'a [String], prefix: &str) -> Option<&'a str> {
    args.iter().find_map(|a| a.strip_prefix(prefix))
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let output_path = match arg_value(&args, "-output=") {
        Some(path) => PathBuf::from(path),
        None => {
            eprintln!("fixture-compiler: missing -output=");
            return ExitCode::from(16);
        }
    };
    let input_path = arg_value(&args, "-input=").map(PathBuf::from);

    if args.iter().any(|a| a == "-info") {
        return run_info(&args, input_path);
    }

    if !args.iter().any(|a| a == "-compile") {
        eprintln!("fixture-compiler: expected -compile or -info");
        return ExitCode::from(16);
    }

    let directives = input_path.as_ref().map(parse_directives).unwrap_or(Directives {
        exit: None,
        version: 1,
        deps: Vec::new(),
    });

    if let Some(code) = directives.exit {
        if code != 0 {
            eprintln!("fixture-compiler: directed to exit {code}");
            return ExitCode::from(code.clamp(0, 255) as u8);
        }
    }

    if let Some(parent) = output_path.parent() {
        if fs::create_dir_all(parent).is_err() {
            return ExitCode::from(16);
        }
    }

    let header = ResourceHeader {
        compiler_version: directives.version,
        install_dependencies: directives.deps,
        source_data_hash: 0,
    };
    let Ok(file) = fs::File::create(&output_path) else {
        return ExitCode::from(16);
    };
    if header.write_to(std::io::BufWriter::new(file)).is_err() {
        return ExitCode::from(16);
    }

    println!("compiled {}", output_path.display());
    ExitCode::SUCCESS
}

fn run_info(args: &[String], input_path: Option<PathBuf>) -> ExitCode {
    let query = arg_value(args, "-query=").unwrap_or("");
    let Some(input_path) = input_path else {
        return ExitCode::SUCCESS;
    };
    let directives = parse_directives(&input_path);
    match query {
        "compile-deps" => {
            // This fixture never declares extra compile-dependency files; the resource's own
            // source timestamp is sufficient for the tests that exercise this path.
        }
        "install-deps" => {
            for dep in &directives.deps {
                println!("{dep}");
            }
        }
        _ => {}
    }
    ExitCode::SUCCESS
}

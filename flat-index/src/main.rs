use std::env;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::process;

use flat_index::FlatL2Index;

fn main() {
    if let Err(err) = run() {
        eprintln!("{}: {err}", env!("CARGO_PKG_NAME"));
        process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let mut args = env::args();
    let program = args
        .next()
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());

    let input = match args.next() {
        Some(flag) if is_help_flag(&flag) => {
            print_help(&program);
            return Ok(());
        }
        Some(flag) if is_version_flag(&flag) => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Some(path) if path == "-" => Input::Stdin,
        Some(path) => Input::File(path),
        None => Input::Stdin,
    };

    if let Some(extra) = args.next() {
        return Err(format!("unexpected argument: {extra}\n{}", usage(&program)));
    }

    let index = match input {
        Input::Stdin => read_index(io::stdin().lock(), "stdin")?,
        Input::File(path) => {
            let file =
                File::open(&path).map_err(|err| format!("failed to open '{path}': {err}"))?;
            read_index(BufReader::new(file), &path)?
        }
    };

    let json = serde_json::to_string_pretty(&index.summary())
        .map_err(|err| format!("failed to serialize JSON: {err}"))?;
    println!("{json}");
    Ok(())
}

enum Input {
    Stdin,
    File(String),
}

fn read_index<R: Read>(reader: R, source: &str) -> Result<FlatL2Index, String> {
    FlatL2Index::read_from(reader).map_err(|err| format!("failed to read index from {source}: {err}"))
}

fn is_help_flag(arg: &str) -> bool {
    arg == "-h" || arg == "--help"
}

fn is_version_flag(arg: &str) -> bool {
    arg == "-V" || arg == "--version"
}

fn print_help(program: &str) {
    println!(
        "{}\n\nOptions:\n  -h, --help      Show this message\n  -V, --version   Print package version",
        usage(program)
    );
}

fn usage(program: &str) -> String {
    format!(
        "Usage: {program} [INDEX_FILE|-]\n\n\
         Print the dimensionality and vector count of a flat L2 index file. \
         Reads stdin when no argument or '-' is passed."
    )
}

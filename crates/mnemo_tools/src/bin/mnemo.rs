#![forbid(unsafe_code)]

use std::env;

use mnemo_tools::ledger_cli::{execute_ledger_command, USAGE};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(2);
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = env::args().skip(1).collect();
    if args.first().map(String::as_str) != Some("ledger") {
        return Err(USAGE.to_string());
    }
    let output = execute_ledger_command(&args[1..])?;
    if !output.is_empty() {
        println!("{output}");
    }
    Ok(())
}

use anyhow::{bail, Context, Result};
use clap::Parser;
use jdb_compiler::compile_program;
use jdb_vm::Vm;
use log::info;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

mod debugger;
mod resolver;

use resolver::FsResolver;

/// BASIC-family interpreter: run a source file, start an interactive
/// REPL, or (with `--debug`) wait for a debugger client on a TCP port
/// before running.
#[derive(Parser)]
#[command(version, about, name = "interpreter")]
struct Params {
    /// open a line-oriented debugger transport on the given TCP port
    /// (default 4711) and wait for a `start` command before running
    #[arg(long, num_args = 0..=1, default_missing_value = "4711")]
    debug: Option<u16>,
    /// run the program in this file instead of starting the REPL
    source_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::init();
    let params = Params::parse();
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    let _guard = rt.enter();

    let exit_code = match &params.source_file {
        Some(path) => run_file(path, params.debug, &rt)?,
        None if params.debug.is_some() => bail!("--debug requires a source file"),
        None => run_repl(&rt)?,
    };
    std::process::exit(exit_code);
}

fn run_file(path: &PathBuf, debug_port: Option<u16>, rt: &tokio::runtime::Runtime) -> Result<i32> {
    let source = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let resolver = FsResolver::new(path.parent());
    let compiled = compile_program(&source, &resolver).with_context(|| format!("compiling {}", path.display()))?;

    if let Some(port) = debug_port {
        return debugger::run_session(compiled, rt, port, path);
    }

    info!("running {}", path.display());
    let mut vm = Vm::new(compiled, rt.handle().clone(), io::stdout());
    vm.install_registry(jdb_stdlib::register_all());
    match vm.run() {
        Ok(_) => Ok(0),
        Err(e) => {
            eprintln!("{}", e.render());
            Ok(1)
        }
    }
}

/// Each entered line is compiled and run as its own tiny program, with
/// globals carried over from the previous line -- this VM compiles
/// whole programs rather than incrementally extending a persistent
/// environment, so there is no single long-lived `Vm` across lines.
fn run_repl(rt: &tokio::runtime::Runtime) -> Result<i32> {
    println!("jdb interpreter -- press ctrl-d to exit");
    let stdin = io::stdin();
    let mut saved_globals = None;
    loop {
        print!("> ");
        io::stdout().flush().ok();
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let compiled = match compile_program(line, &jdb_compiler::NoModules) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("error: {e:#}");
                continue;
            }
        };
        let mut vm = Vm::new(compiled, rt.handle().clone(), io::stdout());
        vm.install_registry(jdb_stdlib::register_all());
        if let Some(globals) = saved_globals.take() {
            vm.set_globals(globals);
        }
        match vm.run() {
            Ok(_) => {}
            Err(e) => eprintln!("{}", e.render()),
        }
        saved_globals = Some(vm.globals().clone());
    }
    Ok(0)
}

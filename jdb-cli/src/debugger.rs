//! Line-oriented debugger transport (§6): a TCP server speaking the
//! newline-terminated `start/continue/next/stepin/stepout/
//! set_breakpoint/get_stacktrace/get_vars/repl/exit` protocol, driving
//! the VM one line at a time via `Vm::debug_tick`.

use anyhow::{Context, Result};
use jdb_compiler::CompiledModule;
use jdb_vm::{to_display_string, Vm};
use std::collections::HashSet;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};

/// Tees VM output (`PRINT`, ...) to the debugger client as `output <text>`
/// messages rather than the process's own stdout.
struct ClientWriter {
    stream: TcpStream,
    partial: String,
}

impl Write for ClientWriter {
    fn write(&mut self, bytes: &[u8]) -> std::io::Result<usize> {
        self.partial.push_str(&String::from_utf8_lossy(bytes));
        while let Some(pos) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=pos).collect();
            writeln!(self.stream, "output {}", line.trim_end_matches('\n'))?;
        }
        Ok(bytes.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.stream.flush()
    }
}

enum StepMode {
    Continue,
    Next,
    StepIn,
    StepOut,
}

pub fn run_session(compiled: CompiledModule, rt: &tokio::runtime::Runtime, port: u16, source_path: &Path) -> Result<i32> {
    let listener = TcpListener::bind(("127.0.0.1", port)).with_context(|| format!("binding debugger port {port}"))?;
    log::info!("debugger listening on 127.0.0.1:{port}");
    let (stream, _) = listener.accept().context("accepting debugger connection")?;
    let mut reader = BufReader::new(stream.try_clone().context("cloning debugger socket")?);
    let writer = ClientWriter { stream: stream.try_clone().context("cloning debugger socket")?, partial: String::new() };

    let mut vm = Vm::new(compiled, rt.handle().clone(), writer);
    vm.install_registry(jdb_stdlib::register_all());

    let mut out = stream;
    let mut breakpoints: HashSet<(Option<String>, u32)> = HashSet::new();
    let path_name = source_path.file_name().map(|n| n.to_string_lossy().to_string());

    writeln!(out, "initialized")?;

    // Wait for the launch request before running anything (§6).
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Ok(0);
        }
        let line = line.trim_end();
        match parse_command(line) {
            Command::SetBreakpoint(path, bp_line) => {
                breakpoints.insert((path, bp_line));
            }
            Command::ClearAllBreakpoints => breakpoints.clear(),
            Command::Start | Command::Continue => break,
            Command::Exit => {
                writeln!(out, "ended")?;
                return Ok(0);
            }
            _ => {}
        }
    }

    writeln!(out, "stopped entry {} {}", vm_line_or_zero(&vm), path_name.clone().unwrap_or_default())?;

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Ok(0);
        }
        let line = line.trim_end();
        match parse_command(line) {
            Command::SetBreakpoint(path, bp_line) => {
                breakpoints.insert((path, bp_line));
                continue;
            }
            Command::ClearAllBreakpoints => {
                breakpoints.clear();
                continue;
            }
            Command::GetStacktrace => {
                let frames = vm.call_stack();
                let total = frames.len() + 1;
                for (i, f) in frames.iter().enumerate() {
                    writeln!(out, "stack: {} {} {} {} {}", i, total, f.line, f.function_name, path_name.clone().unwrap_or_default())?;
                }
                writeln!(out, "stack: {} {} {} {} {}", frames.len(), total, vm_line_or_zero(&vm), "(main)", path_name.clone().unwrap_or_default())?;
                continue;
            }
            Command::GetVars(scope) => {
                let vars = match scope.as_str() {
                    "local" => vm.locals(),
                    _ => vm.global_vars(),
                };
                for (name, value) in vars {
                    writeln!(out, "var: {} {} = {}", scope, name, to_display_string(&value))?;
                }
                writeln!(out, "varsdone")?;
                continue;
            }
            Command::Repl(text) => {
                writeln!(out, "repl: {text}")?;
                continue;
            }
            Command::Exit => {
                writeln!(out, "ended")?;
                return Ok(0);
            }
            Command::Start | Command::Continue => {
                if run_until_stop(&mut vm, &mut out, &breakpoints, &path_name, StepMode::Continue)? {
                    return Ok(0);
                }
            }
            Command::Next => {
                if run_until_stop(&mut vm, &mut out, &breakpoints, &path_name, StepMode::Next)? {
                    return Ok(0);
                }
            }
            Command::StepIn => {
                if run_until_stop(&mut vm, &mut out, &breakpoints, &path_name, StepMode::StepIn)? {
                    return Ok(0);
                }
            }
            Command::StepOut => {
                if run_until_stop(&mut vm, &mut out, &breakpoints, &path_name, StepMode::StepOut)? {
                    return Ok(0);
                }
            }
            Command::Unknown => continue,
        }
    }
}

/// Drive `vm.debug_tick` until a stop condition for `mode` is met.
/// Returns whether the program ran to completion (or errored out).
fn run_until_stop(
    vm: &mut Vm<ClientWriter>,
    out: &mut TcpStream,
    breakpoints: &HashSet<(Option<String>, u32)>,
    path_name: &Option<String>,
    mode: StepMode,
) -> Result<bool> {
    let start_depth = match &mode {
        StepMode::Next | StepMode::StepOut => vm.call_stack().len(),
        _ => 0,
    };
    loop {
        match vm.debug_tick() {
            Err(e) => {
                writeln!(out, "output {}", e.render())?;
                writeln!(out, "ended")?;
                return Ok(true);
            }
            Ok(tick) if tick.finished => {
                writeln!(out, "ended")?;
                return Ok(true);
            }
            Ok(tick) => {
                let hit_breakpoint =
                    breakpoints.contains(&(path_name.clone(), tick.line)) || breakpoints.contains(&(None, tick.line));
                let stop = match mode {
                    StepMode::Continue => hit_breakpoint,
                    StepMode::Next => hit_breakpoint || tick.call_depth <= start_depth,
                    StepMode::StepIn => true,
                    StepMode::StepOut => hit_breakpoint || tick.call_depth < start_depth,
                };
                if stop {
                    let reason = if hit_breakpoint { "breakpoint" } else { "step" };
                    writeln!(out, "stopped {} {} {}", reason, tick.line, path_name.clone().unwrap_or_default())?;
                    return Ok(false);
                }
            }
        }
    }
}

fn vm_line_or_zero(vm: &Vm<ClientWriter>) -> u32 {
    vm.call_stack().last().map(|f| f.line).unwrap_or(0)
}

enum Command {
    Start,
    Continue,
    Next,
    StepIn,
    StepOut,
    SetBreakpoint(Option<String>, u32),
    ClearAllBreakpoints,
    GetStacktrace,
    GetVars(String),
    Repl(String),
    Exit,
    Unknown,
}

fn parse_command(line: &str) -> Command {
    let mut parts = line.splitn(2, ' ');
    let head = parts.next().unwrap_or("");
    let rest = parts.next().unwrap_or("");
    match head {
        "start" => Command::Start,
        "continue" => Command::Continue,
        "next" => Command::Next,
        "stepin" => Command::StepIn,
        "stepout" => Command::StepOut,
        "set_breakpoint" => {
            let mut fields = rest.rsplitn(2, ' ');
            let line_no = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            let path = fields.next().map(|p| PathBuf::from(p).file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default());
            Command::SetBreakpoint(path, line_no)
        }
        "clear_all_breakpoints" => Command::ClearAllBreakpoints,
        "get_stacktrace" => Command::GetStacktrace,
        "get_vars" => Command::GetVars(rest.trim().to_string()),
        "repl" => Command::Repl(rest.to_string()),
        "exit" => Command::Exit,
        _ => Command::Unknown,
    }
}

//! Command-line runner for linked PixIR programs.
//!
//! Loads a program from JSON, runs it against an in-memory surface with the
//! log on stdout and keys read from stdin, and optionally evaluates debugger
//! queries at breakpoints, dumps the final screen as a PPM image, and prints a
//! JSON report of the final state.

use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc::{self, Sender};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use pixir_vm_runtime::host::encode_ppm;
use pixir_vm_runtime::{
    Devices, ErrorKind, ExecutionTrace, Key, PixelBuffer, Program, TextSink, VirtualMachine,
    VmConfig, VmError, VmSnapshot,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "pixir-run")]
#[command(about = "Run a linked PixIR program")]
struct Cli {
    /// Program JSON: a linked program, or `{ "lines": [...], "functions": {...} }`
    program: PathBuf,

    /// Logical screen width
    #[arg(long, default_value_t = 100)]
    width: u32,

    /// Logical screen height
    #[arg(long, default_value_t = 100)]
    height: u32,

    /// Physical surface size as WIDTHxHEIGHT
    #[arg(long, default_value = "500x500", value_parser = parse_surface)]
    surface: (u32, u32),

    /// Pause before the instruction at this 1-based address (repeatable)
    #[arg(long = "break", value_name = "ADDRESS")]
    breakpoints: Vec<usize>,

    /// Query printed at every pause and once the run ends (repeatable)
    #[arg(long = "query", value_name = "QUERY")]
    queries: Vec<String>,

    /// Seed for `irnd`
    #[arg(long)]
    seed: Option<u64>,

    /// Key poll interval for `getchar`, in milliseconds
    #[arg(long, default_value_t = 200)]
    poll_ms: u64,

    /// Write the final surface as a binary PPM image
    #[arg(long, value_name = "PATH")]
    dump_screen: Option<PathBuf>,

    /// Print a JSON report of the final state
    #[arg(long)]
    report: bool,
}

#[derive(Debug, Error)]
#[error("invalid surface size `{0}`, expected WIDTHxHEIGHT")]
struct SurfaceSizeError(String);

fn parse_surface(text: &str) -> Result<(u32, u32), SurfaceSizeError> {
    let invalid = || SurfaceSizeError(text.to_owned());
    let (width, height) = text.split_once(['x', 'X']).ok_or_else(invalid)?;
    let width: u32 = width.trim().parse().map_err(|_| invalid())?;
    let height: u32 = height.trim().parse().map_err(|_| invalid())?;
    if width == 0 || height == 0 {
        return Err(invalid());
    }
    Ok((width, height))
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ProgramSource {
    Text {
        lines: Vec<String>,
        #[serde(default)]
        functions: BTreeMap<String, usize>,
    },
    Linked(Program),
}

impl ProgramSource {
    fn into_program(self) -> anyhow::Result<Program> {
        match self {
            ProgramSource::Text { lines, functions } => {
                Program::from_lines(lines, functions).context("failed to decode program")
            }
            ProgramSource::Linked(program) => Ok(program),
        }
    }
}

#[derive(Debug, Serialize)]
struct RunReport {
    ok: bool,
    snapshot: VmSnapshot,
    trace: ExecutionTrace,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorPayload>,
}

#[derive(Debug, Serialize)]
struct ErrorPayload {
    kind: ErrorKind,
    name: String,
    message: String,
}

impl From<&VmError> for ErrorPayload {
    fn from(error: &VmError) -> Self {
        Self {
            kind: error.kind(),
            name: error.kind().to_string(),
            message: error.to_string(),
        }
    }
}

/// Program log written straight to stdout.
struct StdoutSink;

impl TextSink for StdoutSink {
    fn append(&mut self, text: &str) {
        let mut stdout = io::stdout().lock();
        if let Err(error) = stdout.write_all(text.as_bytes()).and_then(|()| stdout.flush()) {
            warn!(%error, "failed to write program output");
        }
    }
}

/// Forward stdin to the machine one key per character, Enter per line.
fn spawn_key_reader(sender: Sender<Key>) {
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            for ch in line.chars() {
                if sender.send(Key::from_name(&ch.to_string())).is_err() {
                    return;
                }
            }
            if sender.send(Key::Enter).is_err() {
                return;
            }
        }
        debug!("stdin closed");
    });
}

fn print_queries(vm: &VirtualMachine, queries: &[String]) {
    for query in queries {
        match vm.query(query) {
            Ok(answer) => eprintln!("{query} = {answer}"),
            Err(error) => eprintln!("{query}: {}: {error}", error.kind()),
        }
    }
}

fn execute(vm: &mut VirtualMachine, queries: &[String]) -> Result<(), VmError> {
    vm.run()?;
    while vm.is_paused() && !vm.is_halted() {
        info!(pc = vm.program_counter(), "paused");
        print_queries(vm, queries);
        vm.resume()?;
    }
    Ok(())
}

fn run(cli: Cli) -> anyhow::Result<bool> {
    let source = std::fs::read_to_string(&cli.program)
        .with_context(|| format!("failed to read {}", cli.program.display()))?;
    let program = serde_json::from_str::<ProgramSource>(&source)
        .with_context(|| format!("failed to parse {}", cli.program.display()))?
        .into_program()?;

    let mut config = VmConfig::default()
        .with_screen(cli.width, cli.height)
        .with_key_poll_interval(Duration::from_millis(cli.poll_ms));
    if let Some(seed) = cli.seed {
        config = config.with_seed(seed);
    }

    let (sender, receiver) = mpsc::channel();
    spawn_key_reader(sender);
    let (surface_width, surface_height) = cli.surface;
    let devices = Devices::new(
        PixelBuffer::new(surface_width, surface_height),
        StdoutSink,
        receiver,
    );

    let mut vm = VirtualMachine::with_config(devices, config)?;
    vm.load(program);
    for address in &cli.breakpoints {
        vm.add_breakpoint(*address);
    }

    let outcome = execute(&mut vm, &cli.queries);
    print_queries(&vm, &cli.queries);
    if let Err(error) = &outcome {
        eprintln!("{}: {error}", error.kind());
    }

    if let Some(path) = &cli.dump_screen {
        std::fs::write(path, encode_ppm(vm.surface()))
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(path = %path.display(), "screen dumped");
    }

    if cli.report {
        let report = RunReport {
            ok: outcome.is_ok(),
            snapshot: vm.snapshot(),
            trace: vm.trace(),
            error: outcome.as_ref().err().map(ErrorPayload::from),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    Ok(outcome.is_ok())
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    match run(Cli::parse()) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::FAILURE
        }
    }
}

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use miette::{Context, IntoDiagnostic};

use nnrt_backend_core::{BackendPreference, BackendRegistry};
use nnrt_backend_cpu::CpuBackend;
use nnrt_backend_mt::MtBackend;
use nnrt_model::{DataType, Model, OperandId};
use nnrt_runtime::{Execution, MemoryPool, ScratchPolicy};

/// nnrt — run serialized models on the builtin backends
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Serialized model file
    model: PathBuf,

    /// Backend preference: fast, low-power, sustained, or a backend name
    #[arg(short, long, default_value = "fast", value_parser = parse_preference)]
    prefer: BackendPreference,

    /// Timed iterations
    #[arg(short, long, default_value = "10")]
    iterations: u32,

    /// Untimed warmup iterations
    #[arg(long, default_value = "1")]
    warmup: u32,

    /// Print the compiled plan and exit
    #[arg(long)]
    describe: bool,

    /// List available backends and exit
    #[arg(long)]
    list_backends: bool,

    /// Give each execution a private scratch arena
    #[arg(long)]
    isolate_scratch: bool,

    /// Label file (one per line) for a top-5 summary of the first output
    #[arg(long)]
    labels: Option<PathBuf>,

    /// Write the first output's raw bytes here
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn parse_preference(s: &str) -> Result<BackendPreference, String> {
    Ok(match s {
        "fast" | "fast-single-answer" => BackendPreference::FastSingleAnswer,
        "low-power" => BackendPreference::LowPower,
        "sustained" | "sustained-speed" => BackendPreference::SustainedSpeed,
        name => BackendPreference::Exact(name.to_string()),
    })
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> miette::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    // 1. Backend registry: reference CPU is always the fallback.
    let mut registry = BackendRegistry::new();
    registry.register_fallback(Arc::new(CpuBackend));
    registry.register(Arc::new(MtBackend));

    if cli.list_backends {
        for name in registry.names() {
            println!("{name}");
        }
        return Ok(());
    }

    // 2. Load and decode the model.
    let raw = std::fs::read(&cli.model)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to read {}", cli.model.display()))?;
    let model = Arc::new(
        nnrt_import::import_bytes(&raw)
            .map_err(|e| miette::miette!("{e}"))
            .wrap_err("model import failed")?,
    );

    // 3. Compile under the requested preference.
    let plan = Arc::new(
        nnrt_compiler::compile(&model, &cli.prefer, &registry)
            .map_err(|e| miette::miette!("{e}"))
            .wrap_err("compilation failed")?,
    );

    if cli.describe {
        print!("{}", plan.describe());
        return Ok(());
    }

    // 4. Bind deterministic inputs and zeroed outputs.
    let pool = Arc::new(MemoryPool::new());
    let mut exec = Execution::new(Arc::clone(&plan), pool);
    if cli.isolate_scratch {
        exec.set_scratch_policy(ScratchPolicy::PerExecution);
    }
    for (index, id) in model.inputs().iter().enumerate() {
        let data = pattern_bytes(&model, *id);
        exec.set_input(index, &data)
            .map_err(|e| miette::miette!("{e}"))
            .wrap_err_with(|| format!("binding input {index}"))?;
    }
    for (index, id) in model.outputs().iter().enumerate() {
        let size = model.operand(*id).spec.size_bytes();
        exec.set_output(index, vec![0u8; size])
            .map_err(|e| miette::miette!("{e}"))
            .wrap_err_with(|| format!("binding output {index}"))?;
    }

    // 5. Warm up, then time.
    for _ in 0..cli.warmup {
        exec.compute().map_err(|e| miette::miette!("{e}"))?;
    }
    let mut total = Duration::ZERO;
    let mut fastest = Duration::MAX;
    for _ in 0..cli.iterations.max(1) {
        let timings = exec.compute().map_err(|e| miette::miette!("{e}"))?;
        for step in &timings.steps {
            log::debug!(
                "{} on {}: {:.3} ms",
                step.op,
                step.backend,
                step.elapsed.as_secs_f64() * 1e3
            );
        }
        total += timings.total;
        fastest = fastest.min(timings.total);
    }
    let avg = total / cli.iterations.max(1);
    println!(
        "{} steps, {} iterations: avg {:.3} ms, best {:.3} ms",
        plan.steps().len(),
        cli.iterations.max(1),
        avg.as_secs_f64() * 1e3,
        fastest.as_secs_f64() * 1e3,
    );

    // 6. Report the first output.
    let first = *model
        .outputs()
        .first()
        .ok_or_else(|| miette::miette!("model declares no outputs"))?;
    let bytes = exec
        .output(0)
        .ok_or_else(|| miette::miette!("output 0 not bound"))?;
    if let Some(path) = &cli.labels {
        let text = std::fs::read_to_string(path)
            .into_diagnostic()
            .wrap_err_with(|| format!("failed to read {}", path.display()))?;
        let labels: Vec<&str> = text.lines().collect();
        for (rank, (index, score)) in top_k(&scores(&model, first, bytes), 5).iter().enumerate() {
            let label = labels.get(*index).copied().unwrap_or("?");
            println!("{}. {label} ({score:.4})", rank + 1);
        }
    }
    if let Some(path) = &cli.output {
        std::fs::write(path, bytes)
            .into_diagnostic()
            .wrap_err_with(|| format!("failed to write {}", path.display()))?;
    }

    Ok(())
}

/// Deterministic input fill so repeated runs are comparable.
fn pattern_bytes(model: &Model, id: OperandId) -> Vec<u8> {
    let spec = &model.operand(id).spec;
    let count = spec.shape.elem_count();
    match spec.dtype {
        DataType::Float32 => (0..count)
            .flat_map(|i| (((i % 17) as f32) / 16.0).to_le_bytes())
            .collect(),
        DataType::Int32 => (0..count).flat_map(|i| ((i % 7) as i32).to_le_bytes()).collect(),
        DataType::Quant8Asymm { .. } => (0..count).map(|i| (i % 251) as u8).collect(),
    }
}

/// Decode an output buffer to comparable per-element scores.
fn scores(model: &Model, id: OperandId, raw: &[u8]) -> Vec<f32> {
    match model.operand(id).spec.dtype {
        DataType::Float32 => raw
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        DataType::Int32 => raw
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f32)
            .collect(),
        DataType::Quant8Asymm { scale, zero_point } => raw
            .iter()
            .map(|&v| (v as i32 - zero_point) as f32 * scale)
            .collect(),
    }
}

fn top_k(scores: &[f32], k: usize) -> Vec<(usize, f32)> {
    let mut ranked: Vec<(usize, f32)> = scores.iter().copied().enumerate().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked.truncate(k);
    ranked
}

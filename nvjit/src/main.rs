use clap::{Args, Parser, Subcommand};
use log::info;
use nvjit_core::config::StaticDevice;
use nvjit_core::ir::builder::BuilderError;
use nvjit_core::ir::Method;
use nvjit_core::samples::Scenario;
use nvjit_core::supervisor::LocalSupervisor;
use nvjit_core::{GpuOptions, ObjectModel, Parallelizer, PassReport, SimdTarget};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;

/// Times the execution of a closure and prints the elapsed time if verbose.
fn time<T, F: FnOnce() -> T>(name: &str, verbose: bool, f: F) -> T {
    let start = Instant::now();
    let result = f();
    if verbose {
        let elapsed = start.elapsed().as_millis();
        eprintln!("{}: {}ms", name, elapsed);
    }
    result
}

#[derive(Parser)]
#[command(name = "nvjit")]
#[command(about = "Offload parallel loops to NVVM kernels and vectorize the rest", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pass over one of the built-in sample methods
    Demo {
        /// Sample to compile (see `nvjit scenarios`)
        #[arg(value_name = "SCENARIO")]
        scenario: Scenario,

        #[command(flatten)]
        pass: PassArgs,
    },

    /// Run the pass over a method read from a JSON file
    Compile {
        /// Input method in JSON form
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Write the transformed method back as JSON
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        #[command(flatten)]
        pass: PassArgs,
    },

    /// List the built-in sample methods
    Scenarios,
}

#[derive(Args)]
struct PassArgs {
    /// JSON file with GPU options; flags below are applied on top
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Offload forEach and kernel loops to the GPU
    #[arg(long)]
    enable_gpu: bool,

    /// Launch kernels without asking the runtime cost model
    #[arg(long)]
    force: bool,

    /// Allow math library calls inside kernels
    #[arg(long)]
    enable_math: bool,

    /// Do not vectorize loops
    #[arg(long)]
    disable_auto_simd: bool,

    /// Device compute capability, e.g. 3.5
    #[arg(long, value_name = "MAJOR.MINOR", value_parser = parse_version)]
    compute_capability: Option<(u32, u32)>,

    /// NVVM IR version, e.g. 1.2
    #[arg(long, value_name = "MAJOR.MINOR", value_parser = parse_version)]
    nvvm_version: Option<(u32, u32)>,

    /// Directory receiving one `testN.ll` file per kernel
    #[arg(long, value_name = "DIR")]
    kernel_dir: Option<PathBuf>,

    /// Print the method listing after the pass
    #[arg(long)]
    dump: bool,

    /// Print verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn parse_version(s: &str) -> Result<(u32, u32), String> {
    let (major, minor) = s
        .split_once('.')
        .ok_or_else(|| format!("expected MAJOR.MINOR, got '{}'", s))?;
    let major = major.parse().map_err(|e| format!("bad major version: {}", e))?;
    let minor = minor.parse().map_err(|e| format!("bad minor version: {}", e))?;
    Ok((major, minor))
}

#[derive(Debug, Error)]
enum DriverError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Compilation error: {0}")]
    CompilationError(#[from] nvjit_core::CompilerError),

    #[error("Invalid sample method: {0}")]
    BuildError(#[from] BuilderError),

    #[error("Invalid method file: {0}")]
    JsonError(#[from] serde_json::Error),
}

fn main() -> Result<(), DriverError> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Demo { scenario, pass } => {
            let mut method = scenario.build()?;
            run_pass(&mut method, &pass)?;
        }
        Commands::Compile { input, output, pass } => {
            let text = fs::read_to_string(&input)?;
            let mut method: Method = serde_json::from_str(&text)?;
            if pass.verbose {
                info!("Compiling {} from {}", method.name, input.display());
            }
            run_pass(&mut method, &pass)?;
            if let Some(path) = output {
                fs::write(&path, serde_json::to_string_pretty(&method)?)?;
                if pass.verbose {
                    info!("Wrote method to {}", path.display());
                }
            }
        }
        Commands::Scenarios => {
            for scenario in Scenario::ALL {
                println!("{}", scenario);
            }
        }
    }

    Ok(())
}

fn options_from(pass: &PassArgs) -> Result<GpuOptions, DriverError> {
    let mut options = match &pass.config {
        Some(path) => GpuOptions::from_file(path)?,
        None => GpuOptions::default(),
    };
    options.enable_gpu |= pass.enable_gpu;
    options.force |= pass.force;
    options.enable_math |= pass.enable_math;
    options.disable_auto_simd |= pass.disable_auto_simd;
    options.verbose |= pass.verbose;
    Ok(options)
}

fn device_from(pass: &PassArgs) -> StaticDevice {
    let mut device = StaticDevice::default();
    if let Some(cc) = pass.compute_capability {
        device.compute_capability = Some(cc);
    }
    if let Some(version) = pass.nvvm_version {
        device.nvvm_version = Some(version);
    }
    device
}

fn run_pass(method: &mut Method, pass: &PassArgs) -> Result<(), DriverError> {
    let options = options_from(pass)?;
    let device = device_from(pass);
    let object_model = ObjectModel::default();
    let simd = SimdTarget::default();
    let mut supervisor = LocalSupervisor::new();

    let report = time("parallelize", pass.verbose, || {
        let mut parallelizer = Parallelizer::new(&options, &object_model, &simd, &device, &mut supervisor);
        parallelizer.perform(method)
    })?;

    print_report(method, &report);
    if let Some(dir) = &pass.kernel_dir {
        write_kernels(dir, &report, pass.verbose)?;
    } else {
        for kernel in &report.kernels {
            println!("{}", kernel.text);
        }
    }
    if pass.dump {
        print!("{}", method.dump());
    }
    Ok(())
}

fn print_report(method: &Method, report: &PassReport) {
    println!("; {}", method.name);
    for region in &report.offloaded {
        println!(";   offloaded {}", region);
    }
    for (scalar, vector) in &report.vectorized {
        println!(";   vectorized {} as {}", scalar, vector);
    }
    for (region, rejection) in &report.rejections {
        println!(";   rejected {}: {}", region, rejection);
    }
    for error in &report.gpu_errors {
        println!(";   stays on the CPU: {}", error);
    }
}

fn write_kernels(dir: &Path, report: &PassReport, verbose: bool) -> Result<(), DriverError> {
    fs::create_dir_all(dir)?;
    for kernel in &report.kernels {
        let path = dir.join(format!("test{}.ll", kernel.kernel_id));
        fs::write(&path, &kernel.text)?;
        if verbose {
            info!("Wrote kernel to {}", path.display());
        }
    }
    Ok(())
}

// ========================================================================================
//
//                      The command-line orchestrator: emflow
//
// ========================================================================================
//
// This binary drives the library end to end on a circuit snapshot stored as TOML:
// it compiles the block schedule once, then replays it for as many EM steps as
// requested. Tuning knobs come from an optional engine config file, and the
// command line overrides the hyperparameters of the step itself.

#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{CommandFactory, Parser, Subcommand};
use emflow::config::{CircuitFile, EngineConfig};
use emflow::{CompiledSchedule, compile, update};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::error::Error;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Once;
use std::time::Instant;

// ========================================================================================
//                              Command-line interface definition
// ========================================================================================

#[derive(Parser)]
#[command(
    name = "emflow",
    version,
    about = "Block-scheduled EM parameter updates for sum-product circuits"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a circuit's block schedule and print a summary of it
    Inspect {
        /// Circuit snapshot (TOML with `groups`, `params`, `flows`)
        #[arg(value_name = "CIRCUIT")]
        circuit: PathBuf,

        /// Engine configuration file (TOML)
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Run EM parameter updates on a circuit and write the parameters as CSV
    Step {
        /// Circuit snapshot (TOML with `groups`, `params`, `flows`)
        #[arg(value_name = "CIRCUIT")]
        circuit: PathBuf,

        /// Engine configuration file (TOML)
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Number of updates to replay with the snapshot's flows
        #[arg(long, default_value = "1")]
        iterations: usize,

        /// Blend weight of the re-estimate, overriding the config file
        #[arg(long)]
        step_size: Option<f32>,

        /// Dirichlet smoothing strength, overriding the config file
        #[arg(long)]
        pseudocount: Option<f32>,

        /// Output CSV path for the updated parameters
        #[arg(long, value_name = "PATH")]
        out: PathBuf,
    },
}

static RAYON_INIT: Once = Once::new();

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Inspect { circuit, config }) => run_inspect(&circuit, config.as_deref()),
        Some(Commands::Step {
            circuit,
            config,
            iterations,
            step_size,
            pseudocount,
            out,
        }) => run_step(
            &circuit,
            config.as_deref(),
            iterations,
            step_size,
            pseudocount,
            &out,
        ),
        None => {
            Cli::command().print_help().expect("print help");
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

// ========================================================================================
//                              The main orchestration logic
// ========================================================================================

fn load_inputs(
    circuit_path: &Path,
    config_path: Option<&Path>,
) -> Result<(CircuitFile, EngineConfig, CompiledSchedule), Box<dyn Error + Send + Sync>> {
    let config = match config_path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let circuit = CircuitFile::load(circuit_path)?;
    log::info!(
        "Loaded {} node-groups, {} parameters, {} flows from {}",
        circuit.groups.len(),
        circuit.params.len(),
        circuit.flows.len(),
        circuit_path.display()
    );
    let schedule = compile(&circuit.groups, &config.compile_options())?;
    Ok((circuit, config, schedule))
}

fn run_inspect(
    circuit_path: &Path,
    config_path: Option<&Path>,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let (circuit, _, schedule) = load_inputs(circuit_path, config_path)?;

    println!("blocks            {}", schedule.num_blocks());
    println!("nodes             {}", schedule.tot_num_nodes());
    println!("block size        {}", schedule.block_size());
    println!("blocks per unit   {}", schedule.blocks_per_unit());
    println!("work units        {}", schedule.num_units());
    println!(
        "parameter extent  {} (snapshot holds {})",
        schedule.param_extent(),
        circuit.params.len()
    );
    println!(
        "flow extent       {} (snapshot holds {})",
        schedule.flow_extent(),
        circuit.flows.len()
    );
    Ok(())
}

fn run_step(
    circuit_path: &Path,
    config_path: Option<&Path>,
    iterations: usize,
    step_size: Option<f32>,
    pseudocount: Option<f32>,
    out_path: &Path,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    // Initialize the Rayon global thread pool to use all available cores.
    RAYON_INIT.call_once(|| {
        rayon::ThreadPoolBuilder::new()
            .build_global()
            .expect("failed to initialize Rayon global thread pool");
    });

    let overall_start_time = Instant::now();
    let (mut circuit, config, schedule) = load_inputs(circuit_path, config_path)?;

    let mut step = config.em_step();
    if let Some(value) = step_size {
        step.step_size = value;
    }
    if let Some(value) = pseudocount {
        step.pseudocount = value;
    }
    step.validate()?;

    let mut cum_flows = schedule.new_accumulator();
    let pb = create_progress_bar(iterations as u64, "EM updates");
    for _ in 0..iterations {
        update(
            &mut circuit.params,
            &circuit.flows,
            &schedule,
            step,
            Some(&mut cum_flows),
        )?;
        pb.inc(1);
    }
    pb.finish_and_clear();

    write_params_csv(out_path, &circuit.params)?;
    log::info!(
        "Wrote {} parameters to {} after {} updates in {:.2?}",
        circuit.params.len(),
        out_path.display(),
        iterations,
        overall_start_time.elapsed()
    );
    Ok(())
}

fn write_params_csv(path: &Path, params: &[f32]) -> Result<(), Box<dyn Error + Send + Sync>> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["index", "value"])?;
    for (index, value) in params.iter().enumerate() {
        writer.serialize((index, value))?;
    }
    writer.flush()?;
    Ok(())
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    pb.set_style(
        ProgressStyle::with_template("> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  "),
    );
    pb.set_message(message.to_string());
    pb
}

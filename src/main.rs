//! CLI entry point for the checkpoint sweep and dataset bootstrap

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use controlnet_sweep::assign::{assign_epochs, WorkerAssignment};
use controlnet_sweep::bootstrap::{bootstrap, CredentialLoader, HfHub};
use controlnet_sweep::config::{self, BootstrapConfig, SweepConfig};
use controlnet_sweep::download::ModelDownloader;
use controlnet_sweep::pipeline::FluxControlLoader;
use controlnet_sweep::pool::{parse_epochs, ProcessPool, WorkerCommand};
use controlnet_sweep::runner::{run_worker, PairFailure};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "controlnet-sweep")]
#[command(version)]
#[command(about = "Checkpoint sweep over control images and prompts", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Inputs shared by the sweep and its workers
#[derive(Args)]
struct InputArgs {
    /// Directory holding epoch-<N>.safetensors checkpoints
    #[arg(long, default_value = config::MODEL_BASE_PATH)]
    model_base: PathBuf,

    /// Control images (searched recursively)
    #[arg(long, default_value = config::IMAGE_FOLDER)]
    image_folder: PathBuf,

    /// Prompt file, one prompt per line
    #[arg(long, default_value = config::PROMPT_FILE)]
    prompt_file: PathBuf,

    /// Where output_epoch_<N>/ directories are created
    #[arg(long, default_value = ".")]
    output_root: PathBuf,

    /// What a failing (image, prompt) pair does to its epoch
    #[arg(long, value_enum, default_value_t = PairFailure::AbortEpoch)]
    on_error: PairFailure,
}

impl InputArgs {
    fn into_config(self, num_gpus: usize, total_epochs: u32) -> SweepConfig {
        SweepConfig {
            num_gpus,
            total_epochs,
            model_base: self.model_base,
            image_folder: self.image_folder,
            prompt_file: self.prompt_file,
            output_root: self.output_root,
            on_error: self.on_error,
            ..SweepConfig::default()
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run every epoch checkpoint over every control image × prompt
    ///
    /// Epochs are spread round-robin over the GPUs, one worker process per GPU.
    Sweep {
        #[command(flatten)]
        inputs: InputArgs,

        /// Number of GPUs (worker slots)
        #[arg(long, default_value_t = config::NUM_GPUS)]
        num_gpus: usize,

        /// Epochs 1..=N are swept
        #[arg(long, default_value_t = config::TOTAL_EPOCHS)]
        total_epochs: u32,

        /// Run the slots one after another in this process
        #[arg(long)]
        in_process: bool,
    },

    /// Run one slot's epochs (launched by `sweep`)
    #[command(hide = true)]
    Worker {
        #[command(flatten)]
        inputs: InputArgs,

        /// GPU slot / CUDA ordinal
        #[arg(long)]
        slot: usize,

        /// Comma-separated epoch numbers
        #[arg(long)]
        epochs: String,
    },

    /// Log in to the hub and download the training dataset
    ///
    /// Reads the token from the environment or a local .env file.
    Bootstrap {
        /// Dataset repository id
        #[arg(long, default_value = config::DATASET_ID)]
        dataset: String,

        /// Local directory for the dataset
        #[arg(long, default_value = config::DATA_DIR)]
        data_dir: PathBuf,

        /// Env file loaded before reading the token
        #[arg(long, default_value = config::ENV_FILE)]
        env_file: PathBuf,

        /// Environment variable holding the token
        #[arg(long, default_value = config::TOKEN_VAR)]
        token_var: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_ansi(std::io::stdout().is_terminal())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Sweep {
            inputs,
            num_gpus,
            total_epochs,
            in_process,
        } => sweep(inputs.into_config(num_gpus, total_epochs), in_process).await,

        Commands::Worker { inputs, slot, epochs } => {
            let assignment = WorkerAssignment {
                slot,
                epochs: parse_epochs(&epochs)?,
            };
            worker(inputs.into_config(config::NUM_GPUS, config::TOTAL_EPOCHS), assignment).await
        }

        Commands::Bootstrap {
            dataset,
            data_dir,
            env_file,
            token_var,
        } => {
            run_bootstrap(BootstrapConfig {
                dataset,
                data_dir,
                env_file,
                token_var,
            })
            .await
        }
    }
}

async fn sweep(config: SweepConfig, in_process: bool) -> Result<()> {
    if let Err(e) = config.check_inputs() {
        eprintln!("❌ Error: {}", e);
        return Ok(());
    }

    let assignments = assign_epochs(config.total_epochs, config.num_gpus);

    println!();
    println!("Epoch assignment:");
    for assignment in &assignments {
        println!("  GPU {}: {:?}", assignment.slot, assignment.epochs);
    }
    println!();

    let started = Instant::now();

    // Resolve base components once so workers only ever hit the cache
    let paths = match ModelDownloader::new()?.download_all().await {
        Ok(paths) => paths,
        Err(e) => {
            eprintln!("❌ Error: failed to fetch base model components: {:#}", e);
            return Ok(());
        }
    };

    if in_process {
        for assignment in assignments.iter().filter(|a| !a.is_empty()) {
            let loader = FluxControlLoader::new(paths.clone(), assignment.slot)?;
            match run_worker(&loader, assignment, &config) {
                Ok(report) => println!("{}", report.status_line()),
                Err(e) => eprintln!("GPU {} failed: {:#}", assignment.slot, e),
            }
        }
    } else {
        let pool = ProcessPool::new(WorkerCommand::current_exe()?, config);
        let summary = pool.run(&assignments)?;

        let failed = summary.failed_slots();
        if !failed.is_empty() {
            eprintln!("⚠️  Workers failed on GPUs: {:?}", failed);
        }
        tracing::debug!(elapsed = ?summary.elapsed, "Worker pool finished");
    }

    println!();
    println!(
        "✨ All epochs processed! Total time: {:.2} s",
        started.elapsed().as_secs_f64()
    );
    Ok(())
}

async fn worker(config: SweepConfig, assignment: WorkerAssignment) -> Result<()> {
    let paths = ModelDownloader::new()?.download_all().await?;
    let loader = FluxControlLoader::new(paths, assignment.slot)?;

    let report = run_worker(&loader, &assignment, &config)?;
    println!("{}", report.status_line());
    Ok(())
}

async fn run_bootstrap(config: BootstrapConfig) -> Result<()> {
    let credentials = CredentialLoader::new(&config.env_file, &config.token_var);
    let token = credentials.load();
    let token_missing = token.is_none();

    match bootstrap(&HfHub::new(), token, &config.dataset, &config.data_dir).await {
        Some(dataset) => {
            println!();
            println!("✓ Dataset {} saved in: {}", dataset.name, dataset.root.display());
            println!("  {} files", dataset.files.len());
        }
        None if token_missing => {
            eprintln!();
            eprintln!("Add {} to {} or export it:", credentials.var(), config.env_file.display());
            eprintln!("  export {}=hf_your_token_here", credentials.var());
        }
        None => eprintln!("❌ Dataset was not downloaded"),
    }

    Ok(())
}

//! Multi-GPU checkpoint sweep for control-image guided generation
//!
//! Given a directory of per-epoch checkpoints, a folder of control images and
//! a prompt file, every epoch is run over the full image × prompt
//! cross-product and the results land in `output_epoch_<N>/`.
//!
//! ## Pieces
//!
//! - [`assign`]: round-robin split of epochs over GPU slots
//! - [`pool`]: one worker process per non-empty slot
//! - [`runner`]: the per-slot loop, generic over a [`runner::PipelineLoader`]
//! - [`pipeline`]: the FLUX-based loader used in production
//! - [`bootstrap`]: hub login + dataset download
//!
//! ## Usage
//!
//! ```rust,ignore
//! use controlnet_sweep::assign::assign_epochs;
//! use controlnet_sweep::config::SweepConfig;
//! use controlnet_sweep::download::ModelDownloader;
//! use controlnet_sweep::pipeline::FluxControlLoader;
//! use controlnet_sweep::runner::run_worker;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = SweepConfig::default();
//!     config.check_inputs()?;
//!
//!     let paths = ModelDownloader::new()?.download_all().await?;
//!     for assignment in assign_epochs(config.total_epochs, 1) {
//!         let loader = FluxControlLoader::new(paths.clone(), assignment.slot)?;
//!         let report = run_worker(&loader, &assignment, &config)?;
//!         println!("{}", report.status_line());
//!     }
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod assign;
pub mod bootstrap;
pub mod config;
pub mod download;
pub mod inputs;
pub mod models;
pub mod pipeline;
pub mod pool;
pub mod runner;

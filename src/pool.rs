//! Process pool coordinator
//!
//! One OS process per non-empty GPU slot. Each worker is a fresh exec of the
//! current binary (`controlnet-sweep worker ...`), so no accelerator state is
//! ever inherited from the parent. The parent only launches, relays worker
//! output and waits on each process in submission order.

use anyhow::{bail, Context, Result};
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info};

use crate::assign::WorkerAssignment;
use crate::config::SweepConfig;

/// Status lines printed by workers start with this
const STATUS_PREFIX: &str = "GPU ";

/// Program (plus leading args) that runs one worker
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: PathBuf,
    leading_args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>, leading_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            leading_args,
        }
    }

    /// Re-run this executable with the `worker` subcommand
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe().context("Failed to get current executable path")?;
        Ok(Self::new(program, vec!["worker".to_string()]))
    }
}

/// Command-line arguments describing one slot's work
pub fn worker_args(assignment: &WorkerAssignment, config: &SweepConfig) -> Vec<String> {
    vec![
        "--slot".to_string(),
        assignment.slot.to_string(),
        "--epochs".to_string(),
        format_epochs(&assignment.epochs),
        "--model-base".to_string(),
        config.model_base.display().to_string(),
        "--image-folder".to_string(),
        config.image_folder.display().to_string(),
        "--prompt-file".to_string(),
        config.prompt_file.display().to_string(),
        "--output-root".to_string(),
        config.output_root.display().to_string(),
        "--on-error".to_string(),
        config.on_error.as_str().to_string(),
    ]
}

/// `[1, 9, 17]` -> `"1,9,17"`
pub fn format_epochs(epochs: &[u32]) -> String {
    epochs
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// `"1,9,17"` -> `[1, 9, 17]`
pub fn parse_epochs(s: &str) -> Result<Vec<u32>> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            let epoch: u32 = part
                .parse()
                .with_context(|| format!("Invalid epoch number: {:?}", part))?;
            if epoch == 0 {
                bail!("Epoch numbers start at 1");
            }
            Ok(epoch)
        })
        .collect()
}

/// How one slot's worker ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotOutcome {
    pub slot: usize,
    pub success: bool,
    /// Worker's status line, or a description of how it failed
    pub status: String,
}

/// Result of a whole pool run
#[derive(Debug)]
pub struct PoolSummary {
    pub outcomes: Vec<SlotOutcome>,
    pub elapsed: Duration,
}

impl PoolSummary {
    pub fn failed_slots(&self) -> Vec<usize> {
        self.outcomes
            .iter()
            .filter(|o| !o.success)
            .map(|o| o.slot)
            .collect()
    }
}

struct RunningWorker {
    slot: usize,
    child: Child,
    stdout: Option<JoinHandle<Option<String>>>,
    stderr: Option<JoinHandle<Option<String>>>,
}

/// Launches one worker process per non-empty assignment and waits for all of them
pub struct ProcessPool {
    command: WorkerCommand,
    config: SweepConfig,
}

impl ProcessPool {
    pub fn new(command: WorkerCommand, config: SweepConfig) -> Self {
        Self { command, config }
    }

    /// Run the pool to completion.
    ///
    /// Empty assignments never get a process. A worker that fails to start or
    /// exits non-zero is reported as failed; the others are unaffected.
    pub fn run(&self, assignments: &[WorkerAssignment]) -> Result<PoolSummary> {
        let started = Instant::now();
        let mut outcomes = Vec::new();
        let mut running = Vec::new();

        for assignment in assignments.iter().filter(|a| !a.is_empty()) {
            match self.spawn_worker(assignment) {
                Ok(worker) => running.push(worker),
                Err(e) => {
                    error!(slot = assignment.slot, "Failed to launch worker: {:#}", e);
                    let outcome = SlotOutcome {
                        slot: assignment.slot,
                        success: false,
                        status: format!("GPU {} failed to start: {:#}", assignment.slot, e),
                    };
                    println!("{}", outcome.status);
                    outcomes.push(outcome);
                }
            }
        }

        info!(workers = running.len(), "All workers launched, waiting for results");

        for worker in running {
            let outcome = wait_worker(worker);
            println!("{}", outcome.status);
            outcomes.push(outcome);
        }

        outcomes.sort_by_key(|o| o.slot);

        Ok(PoolSummary {
            outcomes,
            elapsed: started.elapsed(),
        })
    }

    fn spawn_worker(&self, assignment: &WorkerAssignment) -> Result<RunningWorker> {
        let args = worker_args(assignment, &self.config);
        info!(
            slot = assignment.slot,
            epochs = ?assignment.epochs,
            "Starting worker process"
        );

        let mut child = Command::new(&self.command.program)
            .args(&self.command.leading_args)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| {
                format!(
                    "Failed to spawn worker for GPU {}: {:?}",
                    assignment.slot, self.command.program
                )
            })?;

        let tag = format!("gpu-{}", assignment.slot);
        let stdout = child
            .stdout
            .take()
            .map(|out| relay_lines(out, tag.clone(), false));
        let stderr = child.stderr.take().map(|err| relay_lines(err, tag, true));

        info!(slot = assignment.slot, pid = child.id(), "Worker started");

        Ok(RunningWorker {
            slot: assignment.slot,
            child,
            stdout,
            stderr,
        })
    }
}

/// Forward a worker stream line by line, remembering its last status line
fn relay_lines<R>(stream: R, tag: String, to_stderr: bool) -> JoinHandle<Option<String>>
where
    R: std::io::Read + Send + 'static,
{
    std::thread::spawn(move || {
        let mut last_status = None;
        for line in BufReader::new(stream).lines().map_while(Result::ok) {
            if to_stderr {
                eprintln!("[{}] {}", tag, line);
            } else {
                println!("[{}] {}", tag, line);
            }
            if line.starts_with(STATUS_PREFIX) {
                last_status = Some(line);
            }
        }
        last_status
    })
}

fn wait_worker(mut worker: RunningWorker) -> SlotOutcome {
    let slot = worker.slot;
    let exit = worker.child.wait();

    let status_line = worker.stdout.take().and_then(|h| h.join().ok().flatten());
    if let Some(handle) = worker.stderr.take() {
        let _ = handle.join();
    }

    match exit {
        Ok(status) if status.success() => SlotOutcome {
            slot,
            success: true,
            status: status_line.unwrap_or_else(|| format!("GPU {} finished", slot)),
        },
        Ok(status) => SlotOutcome {
            slot,
            success: false,
            status: format!("GPU {} failed: worker exited with {}", slot, status),
        },
        Err(e) => SlotOutcome {
            slot,
            success: false,
            status: format!("GPU {} failed: {}", slot, e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assign::assign_epochs;
    use crate::runner::PairFailure;

    #[test]
    fn test_epoch_list_encoding() {
        assert_eq!(format_epochs(&[1, 9, 17]), "1,9,17");
        assert_eq!(format_epochs(&[]), "");
        assert_eq!(parse_epochs("1,9,17").unwrap(), vec![1, 9, 17]);
        assert_eq!(parse_epochs(" 4 , 12 ").unwrap(), vec![4, 12]);
        assert!(parse_epochs("").unwrap().is_empty());
        assert!(parse_epochs("1,x").is_err());
        assert!(parse_epochs("0").is_err());
    }

    #[test]
    fn test_worker_args() {
        let config = SweepConfig {
            on_error: PairFailure::SkipPair,
            ..SweepConfig::default()
        };
        let assignment = WorkerAssignment { slot: 3, epochs: vec![4, 12, 20] };

        let args = worker_args(&assignment, &config);
        let pairs: Vec<_> = args.chunks(2).map(|c| (c[0].as_str(), c[1].as_str())).collect();

        assert!(pairs.contains(&("--slot", "3")));
        assert!(pairs.contains(&("--epochs", "4,12,20")));
        assert!(pairs.contains(&("--on-error", "skip-pair")));
        assert!(pairs.contains(&("--prompt-file", "prompts.txt")));
    }

    #[cfg(unix)]
    #[test]
    fn test_pool_skips_empty_slots() {
        let pool = ProcessPool::new(WorkerCommand::new("true", vec![]), SweepConfig::default());

        let summary = pool.run(&assign_epochs(5, 8)).unwrap();

        let slots: Vec<_> = summary.outcomes.iter().map(|o| o.slot).collect();
        assert_eq!(slots, vec![0, 1, 2, 3, 4]);
        assert!(summary.failed_slots().is_empty());
        assert_eq!(summary.outcomes[2].status, "GPU 2 finished");
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_workers_are_reported() {
        let pool = ProcessPool::new(WorkerCommand::new("false", vec![]), SweepConfig::default());

        let summary = pool.run(&assign_epochs(3, 2)).unwrap();

        assert_eq!(summary.failed_slots(), vec![0, 1]);
        assert!(summary.outcomes[0].status.starts_with("GPU 0 failed"));
    }

    #[cfg(unix)]
    #[test]
    fn test_worker_status_line_is_captured() {
        let script = "echo 'some progress'; echo 'GPU 0 finished: 1 completed'; echo trailing";
        let command = WorkerCommand::new("sh", vec!["-c".to_string(), script.to_string()]);
        let pool = ProcessPool::new(command, SweepConfig::default());

        let summary = pool.run(&assign_epochs(1, 1)).unwrap();

        assert_eq!(summary.outcomes[0].status, "GPU 0 finished: 1 completed");
    }

    #[test]
    fn test_missing_program_does_not_stop_the_pool() {
        let command = WorkerCommand::new("/nonexistent/controlnet-sweep-worker", vec![]);
        let pool = ProcessPool::new(command, SweepConfig::default());

        let summary = pool.run(&assign_epochs(2, 2)).unwrap();

        assert_eq!(summary.failed_slots(), vec![0, 1]);
        assert_eq!(summary.outcomes.len(), 2);
        for (slot, outcome) in summary.outcomes.iter().enumerate() {
            assert_eq!(outcome.slot, slot);
            assert!(outcome.status.starts_with(&format!("GPU {} failed to start", slot)));
        }
    }
}

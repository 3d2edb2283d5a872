use crate::minimizer::CrashValidator;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How a candidate reproducer reaches the replay command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputDelivery {
    StdIn,
    /// Written to a temp file; `{}` in the template is replaced by its path
    /// and the result is appended as whitespace-separated arguments.
    File(String),
}

#[derive(Debug, Clone)]
pub struct CommandValidatorConfig {
    pub command: Vec<String>,
    pub input_delivery: InputDelivery,
    pub timeout: Duration,
    pub working_dir: Option<PathBuf>,
}

/// Replays candidates through an external command, e.g. a script that boots
/// a VM and runs the program. A non-success exit or death by signal means
/// the crash reproduced; timeouts and launch failures mean it did not.
pub struct CommandValidator {
    config: CommandValidatorConfig,
}

#[derive(Debug, PartialEq, Eq)]
enum ReplayOutcome {
    Exited(ExitStatus),
    Timeout,
    Failed(String),
}

impl CommandValidator {
    pub fn new(config: CommandValidatorConfig) -> Self {
        Self { config }
    }

    fn wait_with_timeout(&self, mut child: Child) -> ReplayOutcome {
        let start_time = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return ReplayOutcome::Exited(status),
                Ok(None) => {
                    if start_time.elapsed() > self.config.timeout {
                        debug!("replay timed out, killing");
                        if let Err(e) = child.kill() {
                            return ReplayOutcome::Failed(format!(
                                "Failed to kill timed-out replay: {e}"
                            ));
                        }
                        let _ = child.wait();
                        return ReplayOutcome::Timeout;
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(e) => return ReplayOutcome::Failed(format!("Error waiting for replay: {e}")),
            }
        }
    }

    fn replay(&self, candidate: &str) -> ReplayOutcome {
        let Some((program, args)) = self.config.command.split_first() else {
            return ReplayOutcome::Failed("Replay command is empty".to_string());
        };

        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(cwd) = &self.config.working_dir {
            cmd.current_dir(cwd);
        }
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());

        // Held until the replay finishes so the file outlives the child.
        let mut _temp_file: Option<tempfile::NamedTempFile> = None;
        match &self.config.input_delivery {
            InputDelivery::StdIn => {
                cmd.stdin(Stdio::piped());
            }
            InputDelivery::File(template) => {
                let mut named_temp_file = match tempfile::NamedTempFile::new() {
                    Ok(f) => f,
                    Err(e) => {
                        return ReplayOutcome::Failed(format!("Failed to create temp file: {e}"));
                    }
                };
                if let Err(e) = named_temp_file
                    .write_all(candidate.as_bytes())
                    .and_then(|_| named_temp_file.flush())
                {
                    return ReplayOutcome::Failed(format!(
                        "Failed to write to temp file {:?}: {}",
                        named_temp_file.path(),
                        e
                    ));
                }
                let Some(path_str) = named_temp_file.path().to_str().map(str::to_string) else {
                    return ReplayOutcome::Failed("Temp file path is not valid UTF-8".to_string());
                };
                for part in template.replace("{}", &path_str).split_whitespace() {
                    cmd.arg(part);
                }
                cmd.stdin(Stdio::null());
                _temp_file = Some(named_temp_file);
            }
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ReplayOutcome::Failed(format!(
                    "Failed to spawn command '{:?}': {}",
                    self.config.command, e
                ));
            }
        };

        if self.config.input_delivery == InputDelivery::StdIn {
            if let Some(mut stdin) = child.stdin.take() {
                // A replay that exits before reading everything is not an error.
                if let Err(e) = stdin.write_all(candidate.as_bytes()) {
                    debug!(error = %e, "replay closed stdin early");
                }
            }
        }

        self.wait_with_timeout(child)
    }
}

impl CrashValidator for CommandValidator {
    fn is_crashing(&self, candidate: &str) -> bool {
        match self.replay(candidate) {
            ReplayOutcome::Exited(status) => !status.success(),
            ReplayOutcome::Timeout => false,
            ReplayOutcome::Failed(reason) => {
                warn!(%reason, "replay failed, treating candidate as non-crashing");
                false
            }
        }
    }
}

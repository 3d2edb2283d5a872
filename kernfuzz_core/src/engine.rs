use crate::config::EngineSettings;
use crate::strategy::FuzzingStrategy;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const ENGINE_CONFIG_FILE: &str = "engine.cfg";
pub const ENGINE_LOG_FILE: &str = "engine.log";

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to serialize engine configuration: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Failed to write {path:?}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Engine command is empty")]
    EmptyCommand,
    #[error("Failed to spawn engine command '{command:?}': {source}")]
    Spawn {
        command: Vec<String>,
        source: std::io::Error,
    },
    #[error("Error waiting for engine process: {0}")]
    Wait(#[source] std::io::Error),
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct VmResources {
    pub count: u32,
    pub cpu: u32,
    pub mem: u32,
}

/// Configuration artifact handed to the external engine.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub target: String,
    pub http: String,
    pub workdir: PathBuf,
    pub kernel_obj: PathBuf,
    pub image: PathBuf,
    pub sshkey: PathBuf,
    pub syzkaller: PathBuf,
    pub procs: u32,
    #[serde(rename = "type")]
    pub vm_type: String,
    pub vm: VmResources,
    /// Omitted when empty so the engine falls back to its own syscall set.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub enable_syscalls: Vec<String>,
    pub cover: bool,
    pub comparisons: bool,
    pub fault_injection: bool,
    pub max_crashes: u32,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub target_metadata: BTreeMap<String, String>,
}

impl EngineConfig {
    pub fn build(
        settings: &EngineSettings,
        strategy: &FuzzingStrategy,
        kernel_image: &Path,
        work_dir: &Path,
    ) -> Self {
        let kernel_obj = kernel_image
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let sshkey = settings
            .ssh_key
            .clone()
            .unwrap_or_else(|| kernel_image.with_extension("id_rsa"));

        Self {
            target: settings.target.clone(),
            http: settings.http.clone(),
            workdir: work_dir.to_path_buf(),
            kernel_obj,
            image: kernel_image.to_path_buf(),
            sshkey,
            syzkaller: settings.install_path.clone(),
            procs: settings.procs,
            vm_type: settings.vm_type.clone(),
            vm: VmResources {
                count: settings.vm.count,
                cpu: settings.vm.cpus,
                mem: settings.vm.memory_mb,
            },
            enable_syscalls: strategy.interfaces.clone(),
            cover: strategy.enable_coverage,
            comparisons: strategy.enable_comparisons,
            fault_injection: strategy.enable_fault_injection,
            max_crashes: strategy.max_crashes,
            target_metadata: strategy.metadata.clone(),
        }
    }

    /// Writes the configuration as JSON into `work_dir` and returns its path.
    pub fn write_to(&self, work_dir: &Path) -> Result<PathBuf, EngineError> {
        let path = work_dir.join(ENGINE_CONFIG_FILE);
        let body = serde_json::to_vec_pretty(self)?;
        std::fs::write(&path, body).map_err(|source| EngineError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

/// How supervision of an engine process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisionOutcome {
    /// The engine exited on its own before the deadline.
    Exited(ExitStatus),
    /// The deadline elapsed and the engine was terminated.
    TimedOut(Termination),
    /// A stop request arrived and the engine was terminated.
    Cancelled(Termination),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The engine exited within the grace period after the polite signal.
    Graceful,
    /// The engine had to be killed.
    Forced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisionTimings {
    pub deadline: Duration,
    pub poll_interval: Duration,
    pub grace_period: Duration,
}

/// A running engine child process. Dropping it kills an engine that is still
/// running, so an engine never outlives its handle.
pub struct EngineProcess {
    child: Child,
}

impl EngineProcess {
    /// Starts `command -config <config_path>` inside `work_dir`, with its
    /// output redirected to `work_dir/engine.log`.
    pub fn spawn(
        command: &[String],
        config_path: &Path,
        work_dir: &Path,
    ) -> Result<Self, EngineError> {
        let (program, args) = command.split_first().ok_or(EngineError::EmptyCommand)?;

        let log_path = work_dir.join(ENGINE_LOG_FILE);
        let log_file = File::create(&log_path).map_err(|source| EngineError::Write {
            path: log_path.clone(),
            source,
        })?;
        let err_file = log_file
            .try_clone()
            .map_err(|source| EngineError::Write {
                path: log_path.clone(),
                source,
            })?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg("-config")
            .arg(config_path)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(err_file));

        let child = cmd.spawn().map_err(|source| EngineError::Spawn {
            command: command.to_vec(),
            source,
        })?;
        info!(pid = child.id(), ?command, "engine started");
        Ok(Self { child })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>, EngineError> {
        self.child.try_wait().map_err(EngineError::Wait)
    }

    /// Asks the engine to shut down (SIGTERM on unix).
    pub fn request_termination(&mut self) {
        #[cfg(unix)]
        {
            // SAFETY: `kill` only sends a signal to the pid we spawned and still own.
            let rc = unsafe { libc::kill(self.child.id() as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                warn!(
                    pid = self.child.id(),
                    error = %std::io::Error::last_os_error(),
                    "failed to send SIGTERM to engine"
                );
            }
        }
        #[cfg(not(unix))]
        {
            if let Err(e) = self.child.kill() {
                warn!(pid = self.child.id(), error = %e, "failed to terminate engine");
            }
        }
    }

    pub fn force_kill(&mut self) -> Result<(), EngineError> {
        match self.child.kill() {
            Ok(()) => {}
            // Already exited between the last poll and the kill.
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {}
            Err(e) => return Err(EngineError::Wait(e)),
        }
        self.child.wait().map_err(EngineError::Wait)?;
        Ok(())
    }

    /// Polls the engine until it exits, the deadline passes, or `cancel`
    /// fires. Waiting between polls happens on `cancel`, so a stop request
    /// interrupts the sleep immediately. Returns only once the engine is no
    /// longer running.
    pub fn supervise(
        mut self,
        timings: SupervisionTimings,
        cancel: &Receiver<()>,
    ) -> Result<SupervisionOutcome, EngineError> {
        let start_time = Instant::now();

        loop {
            if let Some(status) = self.try_wait()? {
                debug!(pid = self.id(), %status, "engine exited");
                return Ok(SupervisionOutcome::Exited(status));
            }

            let elapsed = start_time.elapsed();
            if elapsed >= timings.deadline {
                info!(pid = self.id(), ?elapsed, "engine deadline reached, terminating");
                let termination = self.terminate(timings)?;
                return Ok(SupervisionOutcome::TimedOut(termination));
            }

            let wait = timings.poll_interval.min(timings.deadline - elapsed);
            match cancel.recv_timeout(wait) {
                Ok(()) => {
                    info!(pid = self.id(), "stop requested, terminating engine");
                    let termination = self.terminate(timings)?;
                    return Ok(SupervisionOutcome::Cancelled(termination));
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    // Nobody can cancel anymore; fall back to plain sleeping.
                    std::thread::sleep(wait);
                }
            }
        }
    }

    /// Graceful request first, then a kill once the grace period runs out.
    fn terminate(&mut self, timings: SupervisionTimings) -> Result<Termination, EngineError> {
        self.request_termination();

        let grace_start = Instant::now();
        let grace_poll = timings.poll_interval.min(Duration::from_millis(100));
        while grace_start.elapsed() < timings.grace_period {
            if self.try_wait()?.is_some() {
                return Ok(Termination::Graceful);
            }
            std::thread::sleep(grace_poll);
        }
        if self.try_wait()?.is_some() {
            return Ok(Termination::Graceful);
        }

        warn!(pid = self.id(), "engine ignored termination request, killing");
        self.force_kill()?;
        Ok(Termination::Forced)
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            warn!(pid = self.child.id(), "engine handle dropped while running, killing");
            if let Err(e) = self.force_kill() {
                error!(pid = self.child.id(), error = %e, "failed to kill orphaned engine");
            }
        }
    }
}

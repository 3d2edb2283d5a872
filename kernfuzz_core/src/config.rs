use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct VmSettings {
    #[serde(default = "default_vm_count")]
    pub count: u32,
    #[serde(default = "default_vm_cpus")]
    pub cpus: u32,
    #[serde(default = "default_vm_memory_mb")]
    pub memory_mb: u32,
}

fn default_vm_count() -> u32 {
    4
}
fn default_vm_cpus() -> u32 {
    2
}
fn default_vm_memory_mb() -> u32 {
    2048
}

impl Default for VmSettings {
    fn default() -> Self {
        Self {
            count: default_vm_count(),
            cpus: default_vm_cpus(),
            memory_mb: default_vm_memory_mb(),
        }
    }
}

/// How the external fuzzing engine is launched and what it is told about
/// the machines it drives.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EngineSettings {
    /// Program and leading arguments; `-config <file>` is appended.
    #[serde(default = "default_engine_command")]
    pub command: Vec<String>,
    #[serde(default = "default_install_path")]
    pub install_path: PathBuf,
    #[serde(default = "default_target")]
    pub target: String,
    #[serde(default = "default_http")]
    pub http: String,
    #[serde(default = "default_procs")]
    pub procs: u32,
    #[serde(default = "default_vm_type")]
    pub vm_type: String,
    /// Overrides the key path derived from the kernel image.
    pub ssh_key: Option<PathBuf>,
    #[serde(default)]
    pub vm: VmSettings,
}

fn default_engine_command() -> Vec<String> {
    vec!["syz-manager".to_string()]
}
fn default_install_path() -> PathBuf {
    PathBuf::from("/opt/syzkaller")
}
fn default_target() -> String {
    "linux/amd64".to_string()
}
fn default_http() -> String {
    "127.0.0.1:56741".to_string()
}
fn default_procs() -> u32 {
    8
}
fn default_vm_type() -> String {
    "qemu".to_string()
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            command: default_engine_command(),
            install_path: default_install_path(),
            target: default_target(),
            http: default_http(),
            procs: default_procs(),
            vm_type: default_vm_type(),
            ssh_key: None,
            vm: VmSettings::default(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SupervisionSettings {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// Parent of freshly created campaign work directories.
    pub work_root: Option<PathBuf>,
}

/// Lower bound applied to `poll-interval-ms` so supervision never busy-spins.
pub const MIN_POLL_INTERVAL_MS: u64 = 10;

fn default_poll_interval_ms() -> u64 {
    10_000
}
fn default_grace_period_ms() -> u64 {
    30_000
}

impl SupervisionSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(MIN_POLL_INTERVAL_MS))
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn work_root(&self) -> PathBuf {
        self.work_root.clone().unwrap_or_else(std::env::temp_dir)
    }
}

impl Default for SupervisionSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            grace_period_ms: default_grace_period_ms(),
            work_root: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SupervisorConfig {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub supervision: SupervisionSettings,
}

impl SupervisorConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;
        Self::from_toml_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

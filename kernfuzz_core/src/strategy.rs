use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Default wall-clock bound for a single campaign.
pub const DEFAULT_MAX_EXECUTION_TIME_SECONDS: u64 = 3600;
/// Default soft cap on crashes the engine is asked to collect.
pub const DEFAULT_MAX_CRASHES: u32 = 100;

const FILESYSTEM_SYSCALLS: &[&str] = &[
    "open",
    "read",
    "write",
    "close",
    "stat",
    "fstat",
    "lstat",
    "mkdir",
    "rmdir",
    "unlink",
    "rename",
    "link",
    "symlink",
    "readlink",
    "chmod",
    "chown",
    "truncate",
    "ftruncate",
];

const NETWORK_SYSCALLS: &[&str] = &[
    "socket",
    "bind",
    "connect",
    "listen",
    "accept",
    "accept4",
    "sendto",
    "recvfrom",
    "sendmsg",
    "recvmsg",
    "setsockopt",
    "getsockopt",
    "shutdown",
    "getsockname",
    "getpeername",
];

const PROCESS_SYSCALLS: &[&str] = &[
    "fork",
    "vfork",
    "clone",
    "execve",
    "exit",
    "exit_group",
    "wait4",
    "kill",
    "getpid",
    "getppid",
    "setuid",
    "setgid",
    "prctl",
];

const MEMORY_SYSCALLS: &[&str] = &[
    "mmap", "munmap", "mprotect", "mremap", "madvise", "brk", "mlock", "munlock", "msync",
    "mincore",
];

const IPC_SYSCALLS: &[&str] = &[
    "pipe", "pipe2", "msgget", "msgsnd", "msgrcv", "msgctl", "semget", "semop", "semctl",
    "shmget", "shmat", "shmdt", "shmctl", "eventfd", "futex",
];

/// Named syscall groups in declaration order. `"all"` is their concatenation.
pub const SYSCALL_GROUPS: &[(&str, &[&str])] = &[
    ("filesystem", FILESYSTEM_SYSCALLS),
    ("network", NETWORK_SYSCALLS),
    ("process", PROCESS_SYSCALLS),
    ("memory", MEMORY_SYSCALLS),
    ("ipc", IPC_SYSCALLS),
];

const IOCTL_INTERFACES: &[&str] = &["ioctl", "open", "close"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StrategyError {
    #[error("max_execution_time_seconds must be positive for strategy '{0}'")]
    InvalidExecutionTime(String),
    #[error("max_crashes must be positive for strategy '{0}'")]
    InvalidMaxCrashes(String),
    #[error("strategy '{0}' targets no interfaces")]
    EmptyInterfaces(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Syscall,
    Ioctl,
    Network,
    Filesystem,
    DeviceDriver,
    Custom,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Syscall => "syscall",
            TargetKind::Ioctl => "ioctl",
            TargetKind::Network => "network",
            TargetKind::Filesystem => "filesystem",
            TargetKind::DeviceDriver => "device_driver",
            TargetKind::Custom => "custom",
        }
    }
}

/// Describes what a campaign fuzzes and how the engine is asked to behave.
///
/// Strategies are plain values: the generator functions below build them and
/// the `with_*` methods return adjusted copies. The campaign keeps its own copy.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FuzzingStrategy {
    pub target_kind: TargetKind,
    pub target_name: String,
    pub interfaces: Vec<String>,
    pub enable_coverage: bool,
    pub enable_comparisons: bool,
    pub enable_fault_injection: bool,
    pub max_execution_time_seconds: u64,
    pub max_crashes: u32,
    pub metadata: BTreeMap<String, String>,
}

impl FuzzingStrategy {
    pub fn new(
        target_kind: TargetKind,
        target_name: impl Into<String>,
        interfaces: Vec<String>,
    ) -> Self {
        Self {
            target_kind,
            target_name: target_name.into(),
            interfaces,
            enable_coverage: true,
            enable_comparisons: true,
            enable_fault_injection: false,
            max_execution_time_seconds: DEFAULT_MAX_EXECUTION_TIME_SECONDS,
            max_crashes: DEFAULT_MAX_CRASHES,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_max_execution_time(mut self, seconds: u64) -> Self {
        self.max_execution_time_seconds = seconds;
        self
    }

    pub fn with_max_crashes(mut self, max_crashes: u32) -> Self {
        self.max_crashes = max_crashes;
        self
    }

    pub fn with_coverage(mut self, enabled: bool) -> Self {
        self.enable_coverage = enabled;
        self
    }

    pub fn with_comparisons(mut self, enabled: bool) -> Self {
        self.enable_comparisons = enabled;
        self
    }

    pub fn with_fault_injection(mut self, enabled: bool) -> Self {
        self.enable_fault_injection = enabled;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Checks the bounds and interface list a campaign relies on.
    ///
    /// Only syscall and custom strategies may have no interfaces: an unknown
    /// syscall group falls back to an empty list, and the engine then uses its
    /// own default syscall set.
    pub fn validate(&self) -> Result<(), StrategyError> {
        if self.max_execution_time_seconds == 0 {
            return Err(StrategyError::InvalidExecutionTime(self.target_name.clone()));
        }
        if self.max_crashes == 0 {
            return Err(StrategyError::InvalidMaxCrashes(self.target_name.clone()));
        }
        let may_be_empty = matches!(self.target_kind, TargetKind::Syscall | TargetKind::Custom);
        if self.interfaces.is_empty() && !may_be_empty {
            return Err(StrategyError::EmptyInterfaces(self.target_name.clone()));
        }
        Ok(())
    }
}

fn to_owned_list(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// Looks up a named syscall group. `"all"` concatenates every group in
/// declaration order; unknown names yield `None`.
pub fn syscall_group(group: &str) -> Option<Vec<String>> {
    if group == "all" {
        let all = SYSCALL_GROUPS
            .iter()
            .flat_map(|(_, calls)| calls.iter().map(|s| s.to_string()))
            .collect();
        return Some(all);
    }
    SYSCALL_GROUPS
        .iter()
        .find(|(name, _)| *name == group)
        .map(|(_, calls)| to_owned_list(calls))
}

/// Strategy exercising a syscall group. Unknown groups produce an empty
/// interface list instead of an error.
pub fn syscall_strategy(group: &str) -> FuzzingStrategy {
    let interfaces = syscall_group(group).unwrap_or_default();
    FuzzingStrategy::new(TargetKind::Syscall, format!("syscall_{group}"), interfaces)
        .with_metadata("syscall_group", group)
}

pub fn ioctl_strategy(device_path: &str, commands: Option<&[String]>) -> FuzzingStrategy {
    let mut strategy = FuzzingStrategy::new(
        TargetKind::Ioctl,
        format!("ioctl_{}", device_name(device_path)),
        to_owned_list(IOCTL_INTERFACES),
    )
    .with_metadata("device_path", device_path);
    if let Some(commands) = commands {
        strategy = strategy.with_metadata("commands", commands.join(","));
    }
    strategy
}

pub fn network_strategy(protocol: &str, address_family: Option<&str>) -> FuzzingStrategy {
    FuzzingStrategy::new(
        TargetKind::Network,
        format!("network_{protocol}"),
        to_owned_list(NETWORK_SYSCALLS),
    )
    .with_metadata("protocol", protocol)
    .with_metadata("address_family", address_family.unwrap_or("AF_INET"))
}

pub fn filesystem_strategy(fs_type: &str) -> FuzzingStrategy {
    FuzzingStrategy::new(
        TargetKind::Filesystem,
        format!("filesystem_{fs_type}"),
        to_owned_list(FILESYSTEM_SYSCALLS),
    )
    .with_metadata("fs_type", fs_type)
}

pub fn custom_strategy(name: &str, interfaces: Vec<String>) -> FuzzingStrategy {
    FuzzingStrategy::new(TargetKind::Custom, name, interfaces)
}

fn device_name(device_path: &str) -> &str {
    device_path
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or(device_path)
}

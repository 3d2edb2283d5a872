pub mod campaign;
pub mod classifier;
pub mod collect;
pub mod config;
pub mod engine;
pub mod minimizer;
pub mod strategy;
pub mod supervisor;
pub mod validator;

pub use campaign::{
    CampaignReport, CampaignStatistics, CampaignStatus, CrashInfo, CrashSummary, FuzzingCampaign,
};
pub use classifier::{CrashClassifier, CrashDetection, CrashType, Severity};
pub use config::SupervisorConfig;
pub use engine::{EngineConfig, EngineError, SupervisionOutcome, Termination};
pub use minimizer::{CrashValidator, ReproducerMinimizer};
pub use strategy::{
    FuzzingStrategy, StrategyError, TargetKind, custom_strategy, filesystem_strategy,
    ioctl_strategy, network_strategy, syscall_strategy,
};
pub use supervisor::{CampaignSupervisor, SupervisorError};
pub use validator::{CommandValidator, CommandValidatorConfig, InputDelivery};

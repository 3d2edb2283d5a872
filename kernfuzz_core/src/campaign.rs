use crate::classifier::{CrashType, Severity};
use crate::strategy::{FuzzingStrategy, TargetKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Campaign lifecycle. `Running` is the only non-terminal state.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum CampaignStatus {
    Running,
    Completed,
    Stopped,
    Error,
}

impl CampaignStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CampaignStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Running => "RUNNING",
            CampaignStatus::Completed => "COMPLETED",
            CampaignStatus::Stopped => "STOPPED",
            CampaignStatus::Error => "ERROR",
        }
    }
}

/// One defect found by the engine.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CrashInfo {
    /// Name of the engine's crash directory; unique within a campaign.
    pub crash_id: String,
    pub title: String,
    pub crash_type: CrashType,
    pub severity: Severity,
    pub reproducer: Option<String>,
    /// MD5 hex digest of `reproducer`, when present.
    pub reproducer_hash: Option<String>,
    /// Set only by an explicit minimization; never longer than `reproducer`.
    pub minimized_reproducer: Option<String>,
    pub raw_log_excerpt: String,
    pub stack_trace: Option<String>,
    pub affected_function: Option<String>,
    pub discovered_at: DateTime<Utc>,
}

impl CrashInfo {
    pub fn reproducer_digest(reproducer: &str) -> String {
        format!("{:x}", md5::compute(reproducer.as_bytes()))
    }
}

/// One run of a strategy against one kernel image.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FuzzingCampaign {
    pub campaign_id: String,
    pub strategy: FuzzingStrategy,
    pub kernel_image: String,
    pub work_dir: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: CampaignStatus,
    pub total_executions: u64,
    pub crashes_found: usize,
    pub unique_crash_count: usize,
    pub coverage_percentage: f64,
    pub crashes: Vec<CrashInfo>,
    /// Why the campaign ended in `Error`.
    pub error_message: Option<String>,
}

impl FuzzingCampaign {
    pub fn new(
        campaign_id: String,
        strategy: FuzzingStrategy,
        kernel_image: String,
        work_dir: String,
    ) -> Self {
        Self {
            campaign_id,
            strategy,
            kernel_image,
            work_dir,
            start_time: Utc::now(),
            end_time: None,
            status: CampaignStatus::Running,
            total_executions: 0,
            crashes_found: 0,
            unique_crash_count: 0,
            coverage_percentage: 0.0,
            crashes: Vec::new(),
            error_message: None,
        }
    }

    /// Replaces the crash list and recomputes the derived counters.
    pub fn set_crashes(&mut self, crashes: Vec<CrashInfo>) {
        self.crashes_found = crashes.len();
        self.unique_crash_count = crashes
            .iter()
            .map(|c| c.title.as_str())
            .collect::<HashSet<_>>()
            .len();
        self.crashes = crashes;
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = CampaignStatus::Error;
        self.error_message = Some(message.into());
        self.end_time = Some(Utc::now());
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds() as f64 / 1000.0)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CrashSummary {
    pub crash_id: String,
    pub title: String,
    pub crash_type: CrashType,
    pub severity: Severity,
    pub affected_function: Option<String>,
    pub reproducer_hash: Option<String>,
    pub minimized: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CampaignReport {
    pub campaign_id: String,
    pub target_name: String,
    pub target_kind: TargetKind,
    pub kernel_image: String,
    pub status: CampaignStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// `None` until the campaign has ended.
    pub duration_seconds: Option<f64>,
    pub total_executions: u64,
    pub coverage_percentage: f64,
    pub crashes_found: usize,
    pub unique_crash_count: usize,
    pub crashes_by_type: BTreeMap<String, usize>,
    pub crashes_by_severity: BTreeMap<String, usize>,
    pub crashes: Vec<CrashSummary>,
    pub error_message: Option<String>,
}

impl CampaignReport {
    pub fn from_campaign(campaign: &FuzzingCampaign) -> Self {
        let mut crashes_by_type = BTreeMap::new();
        let mut crashes_by_severity = BTreeMap::new();
        for crash in &campaign.crashes {
            *crashes_by_type
                .entry(crash.crash_type.as_str().to_string())
                .or_insert(0) += 1;
            *crashes_by_severity
                .entry(crash.severity.as_str().to_string())
                .or_insert(0) += 1;
        }

        let crashes = campaign
            .crashes
            .iter()
            .map(|crash| CrashSummary {
                crash_id: crash.crash_id.clone(),
                title: crash.title.clone(),
                crash_type: crash.crash_type,
                severity: crash.severity,
                affected_function: crash.affected_function.clone(),
                reproducer_hash: crash.reproducer_hash.clone(),
                minimized: crash.minimized_reproducer.is_some(),
            })
            .collect();

        Self {
            campaign_id: campaign.campaign_id.clone(),
            target_name: campaign.strategy.target_name.clone(),
            target_kind: campaign.strategy.target_kind,
            kernel_image: campaign.kernel_image.clone(),
            status: campaign.status,
            start_time: campaign.start_time,
            end_time: campaign.end_time,
            duration_seconds: campaign.duration_seconds(),
            total_executions: campaign.total_executions,
            coverage_percentage: campaign.coverage_percentage,
            crashes_found: campaign.crashes_found,
            unique_crash_count: campaign.unique_crash_count,
            crashes_by_type,
            crashes_by_severity,
            crashes,
            error_message: campaign.error_message.clone(),
        }
    }
}

/// Aggregate over every campaign in a supervisor's registry.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CampaignStatistics {
    pub total_campaigns: usize,
    pub completed_campaigns: usize,
    pub running_campaigns: usize,
    pub stopped_campaigns: usize,
    pub failed_campaigns: usize,
    pub total_crashes: usize,
    pub total_executions: u64,
}

impl CampaignStatistics {
    pub fn record(&mut self, campaign: &FuzzingCampaign) {
        self.total_campaigns += 1;
        match campaign.status {
            CampaignStatus::Running => self.running_campaigns += 1,
            CampaignStatus::Completed => self.completed_campaigns += 1,
            CampaignStatus::Stopped => self.stopped_campaigns += 1,
            CampaignStatus::Error => self.failed_campaigns += 1,
        }
        self.total_crashes += campaign.crashes_found;
        self.total_executions += campaign.total_executions;
    }
}

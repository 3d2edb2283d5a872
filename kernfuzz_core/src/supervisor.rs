use crate::campaign::{
    CampaignReport, CampaignStatistics, CampaignStatus, CrashInfo, FuzzingCampaign,
};
use crate::classifier::CrashClassifier;
use crate::collect::{collect_crashes, read_stats};
use crate::config::SupervisorConfig;
use crate::engine::{
    EngineConfig, EngineError, EngineProcess, SupervisionOutcome, SupervisionTimings,
};
use crate::minimizer::{CrashValidator, ReproducerMinimizer};
use crate::strategy::{FuzzingStrategy, StrategyError};
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("Invalid fuzzing strategy: {0}")]
    InvalidStrategy(#[from] StrategyError),
}

type Registry = Arc<RwLock<HashMap<String, FuzzingCampaign>>>;

struct SupervisionTask {
    cancel: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

/// Owns every campaign it starts and the threads supervising their engines.
///
/// Callers only ever see campaign ids and cloned snapshots. Each engine is
/// supervised on its own thread so a long campaign never blocks another.
pub struct CampaignSupervisor {
    config: SupervisorConfig,
    classifier: CrashClassifier,
    minimizer: ReproducerMinimizer,
    campaigns: Registry,
    tasks: Mutex<HashMap<String, SupervisionTask>>,
}

impl CampaignSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            classifier: CrashClassifier::new(),
            minimizer: ReproducerMinimizer::new(),
            campaigns: Arc::new(RwLock::new(HashMap::new())),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Starts a campaign and returns its initial snapshot.
    ///
    /// Only an invalid strategy is reported as `Err`. If the engine cannot be
    /// launched the returned campaign is already in `Error` state.
    pub fn start_campaign(
        &self,
        strategy: FuzzingStrategy,
        kernel_image: &Path,
        work_dir: Option<PathBuf>,
    ) -> Result<FuzzingCampaign, SupervisorError> {
        strategy.validate()?;

        let campaign_id = Uuid::new_v4().to_string();
        let work_dir = work_dir.unwrap_or_else(|| {
            self.config
                .supervision
                .work_root()
                .join(format!("kernfuzz-{campaign_id}"))
        });
        // The engine runs inside its work dir, so every path it is handed
        // must not depend on our current directory.
        let work_dir = absolute_path(&work_dir);
        let kernel_image = absolute_path(kernel_image);
        let deadline = Duration::from_secs(strategy.max_execution_time_seconds);

        let mut campaign = FuzzingCampaign::new(
            campaign_id.clone(),
            strategy,
            kernel_image.display().to_string(),
            work_dir.display().to_string(),
        );
        info!(
            campaign_id = %campaign_id,
            target = %campaign.strategy.target_name,
            work_dir = %campaign.work_dir,
            "starting campaign"
        );

        let process = match self.launch_engine(&campaign.strategy, &kernel_image, &work_dir) {
            Ok(process) => process,
            Err(e) => {
                error!(campaign_id = %campaign_id, error = %e, "failed to launch engine");
                campaign.fail(e.to_string());
                write_lock(&self.campaigns).insert(campaign_id, campaign.clone());
                return Ok(campaign);
            }
        };
        let timings = SupervisionTimings {
            deadline,
            poll_interval: self.config.supervision.poll_interval(),
            grace_period: self.config.supervision.grace_period(),
        };
        let (cancel_tx, cancel_rx) = mpsc::channel();
        let registry = Arc::clone(&self.campaigns);
        let classifier = self.classifier.clone();
        let task_id = campaign_id.clone();
        // The task must exist before the campaign becomes visible, otherwise a
        // concurrent stop could mark it STOPPED without signalling the engine.
        lock(&self.tasks).insert(
            campaign_id.clone(),
            SupervisionTask {
                cancel: cancel_tx,
                handle: None,
            },
        );
        write_lock(&self.campaigns).insert(campaign_id.clone(), campaign.clone());

        let spawned = std::thread::Builder::new()
            .name(format!("campaign-{}", &campaign_id[..8]))
            .spawn(move || {
                let outcome = process.supervise(timings, &cancel_rx);
                let crashes = collect_crashes(&work_dir, &classifier);
                let stats = read_stats(&work_dir);
                let mut campaigns = write_lock(&registry);
                if let Some(campaign) = campaigns.get_mut(&task_id) {
                    finish_campaign(campaign, outcome, crashes, stats.exec_total, stats.coverage);
                }
            });

        match spawned {
            Ok(handle) => {
                if let Some(task) = lock(&self.tasks).get_mut(&campaign_id) {
                    task.handle = Some(handle);
                }
                Ok(campaign)
            }
            Err(e) => {
                // Dropping the closure dropped the EngineProcess, which kills
                // the engine.
                error!(
                    campaign_id = %campaign_id,
                    error = %e,
                    "failed to spawn supervision thread"
                );
                lock(&self.tasks).remove(&campaign_id);
                campaign.fail(format!("Failed to spawn supervision thread: {e}"));
                write_lock(&self.campaigns).insert(campaign_id, campaign.clone());
                Ok(campaign)
            }
        }
    }

    fn launch_engine(
        &self,
        strategy: &FuzzingStrategy,
        kernel_image: &Path,
        work_dir: &Path,
    ) -> Result<EngineProcess, EngineError> {
        std::fs::create_dir_all(work_dir).map_err(|source| EngineError::Write {
            path: work_dir.to_path_buf(),
            source,
        })?;
        let engine_config =
            EngineConfig::build(&self.config.engine, strategy, kernel_image, work_dir);
        let config_path = engine_config.write_to(work_dir)?;
        EngineProcess::spawn(&self.config.engine.command, &config_path, work_dir)
    }

    /// Stops a running campaign. Returns `false` for unknown or already
    /// terminal campaigns, so repeated or racing calls are harmless.
    pub fn stop_campaign(&self, campaign_id: &str) -> bool {
        {
            let mut campaigns = write_lock(&self.campaigns);
            match campaigns.get_mut(campaign_id) {
                Some(campaign) if !campaign.status.is_terminal() => {
                    campaign.status = CampaignStatus::Stopped;
                    campaign.end_time = Some(Utc::now());
                }
                _ => return false,
            }
        }

        info!(campaign_id = %campaign_id, "stopping campaign");
        if let Some(task) = lock(&self.tasks).get(campaign_id) {
            // The supervision thread may already be finishing; a closed
            // channel just means there is nothing left to cancel.
            let _ = task.cancel.send(());
        }
        true
    }

    pub fn get_campaign(&self, campaign_id: &str) -> Option<FuzzingCampaign> {
        read_lock(&self.campaigns).get(campaign_id).cloned()
    }

    /// Snapshots of every campaign, oldest first.
    pub fn list_campaigns(&self) -> Vec<FuzzingCampaign> {
        let mut campaigns: Vec<FuzzingCampaign> =
            read_lock(&self.campaigns).values().cloned().collect();
        campaigns.sort_by_key(|c| c.start_time);
        campaigns
    }

    /// Blocks until the campaign's supervision thread has finished, then
    /// returns the final snapshot.
    pub fn wait_campaign(&self, campaign_id: &str) -> Option<FuzzingCampaign> {
        let handle = lock(&self.tasks)
            .get_mut(campaign_id)
            .and_then(|task| task.handle.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(campaign_id = %campaign_id, "supervision thread panicked");
            }
        }
        self.get_campaign(campaign_id)
    }

    pub fn generate_report(&self, campaign: &FuzzingCampaign) -> CampaignReport {
        CampaignReport::from_campaign(campaign)
    }

    /// Returns a copy of `crash` with `minimized_reproducer` set, or the crash
    /// unchanged when it has no reproducer.
    pub fn minimize_crash<V>(&self, crash: &CrashInfo, validator: &V) -> CrashInfo
    where
        V: CrashValidator + ?Sized,
    {
        let Some(reproducer) = crash.reproducer.as_deref() else {
            return crash.clone();
        };
        let minimized = self.minimizer.minimize(reproducer, validator);
        info!(
            crash_id = %crash.crash_id,
            original_len = reproducer.len(),
            minimized_len = minimized.len(),
            "crash reproducer minimized"
        );
        CrashInfo {
            minimized_reproducer: Some(minimized),
            ..crash.clone()
        }
    }

    /// Minimizes a stored crash and attaches the result to it in the registry.
    /// The registry lock is not held while the validator runs.
    pub fn minimize_campaign_crash<V>(
        &self,
        campaign_id: &str,
        crash_id: &str,
        validator: &V,
    ) -> Option<CrashInfo>
    where
        V: CrashValidator + ?Sized,
    {
        let crash = read_lock(&self.campaigns)
            .get(campaign_id)?
            .crashes
            .iter()
            .find(|c| c.crash_id == crash_id)
            .cloned()?;

        let minimized = self.minimize_crash(&crash, validator);

        let mut campaigns = write_lock(&self.campaigns);
        let stored = campaigns
            .get_mut(campaign_id)?
            .crashes
            .iter_mut()
            .find(|c| c.crash_id == crash_id)?;
        stored.minimized_reproducer = minimized.minimized_reproducer.clone();
        Some(stored.clone())
    }

    pub fn get_statistics(&self) -> CampaignStatistics {
        let campaigns = read_lock(&self.campaigns);
        let mut stats = CampaignStatistics::default();
        for campaign in campaigns.values() {
            stats.record(campaign);
        }
        stats
    }

    fn running_campaign_ids(&self) -> Vec<String> {
        read_lock(&self.campaigns)
            .values()
            .filter(|c| !c.status.is_terminal())
            .map(|c| c.campaign_id.clone())
            .collect()
    }
}

impl Drop for CampaignSupervisor {
    fn drop(&mut self) {
        for campaign_id in self.running_campaign_ids() {
            self.stop_campaign(&campaign_id);
        }
    }
}

fn finish_campaign(
    campaign: &mut FuzzingCampaign,
    outcome: Result<SupervisionOutcome, EngineError>,
    crashes: Vec<CrashInfo>,
    total_executions: u64,
    coverage_percentage: f64,
) {
    campaign.set_crashes(crashes);
    campaign.total_executions = total_executions;
    campaign.coverage_percentage = coverage_percentage;

    let campaign_id = campaign.campaign_id.clone();
    match &outcome {
        Ok(SupervisionOutcome::Exited(status)) if !status.success() => {
            warn!(campaign_id = %campaign_id, %status, "engine exited abnormally");
        }
        Ok(SupervisionOutcome::TimedOut(termination)) => {
            info!(campaign_id = %campaign_id, ?termination, "engine stopped at deadline");
        }
        Ok(SupervisionOutcome::Cancelled(termination)) => {
            info!(campaign_id = %campaign_id, ?termination, "engine stopped on request");
        }
        Ok(SupervisionOutcome::Exited(_)) => {}
        Err(e) => {
            error!(campaign_id = %campaign_id, error = %e, "engine supervision failed");
        }
    }

    // A stopped campaign keeps its status and stop time.
    if campaign.status.is_terminal() {
        return;
    }
    match outcome {
        Ok(_) => {
            campaign.status = CampaignStatus::Completed;
            campaign.end_time = Some(Utc::now());
        }
        Err(e) => campaign.fail(e.to_string()),
    }
    info!(
        campaign_id = %campaign_id,
        status = campaign.status.as_str(),
        crashes = campaign.crashes_found,
        unique = campaign.unique_crash_count,
        executions = campaign.total_executions,
        "campaign finished"
    );
}

fn absolute_path(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

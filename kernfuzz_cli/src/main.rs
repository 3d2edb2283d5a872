use kernfuzz_core::campaign::CampaignStatus;
use kernfuzz_core::classifier::CrashClassifier;
use kernfuzz_core::config::SupervisorConfig;
use kernfuzz_core::minimizer::{CrashValidator, ReproducerMinimizer};
use kernfuzz_core::strategy::{
    FuzzingStrategy, filesystem_strategy, ioctl_strategy, network_strategy, syscall_strategy,
};
use kernfuzz_core::supervisor::CampaignSupervisor;
use kernfuzz_core::validator::{CommandValidator, CommandValidatorConfig, InputDelivery};

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_CONFIG_FILE: &str = "kernfuzz.toml";

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long = "config", global = true, value_parser)]
    config_file: Option<PathBuf>,
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one fuzzing campaign and print its report as JSON.
    Run(RunArgs),
    /// Classify a kernel console log.
    Classify {
        #[clap(short, long, value_parser)]
        log: PathBuf,
    },
    /// Shrink a reproducer, replaying candidates through a command.
    Minimize {
        #[clap(short, long, value_parser)]
        input: PathBuf,
        /// Pass each candidate as a temp file instead of on stdin; `{}` is
        /// replaced by the file path.
        #[clap(long)]
        file_template: Option<String>,
        #[clap(long, default_value_t = 60_000)]
        timeout_ms: u64,
        #[clap(last = true, required = true)]
        command: Vec<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum KindArg {
    Syscall,
    Ioctl,
    Network,
    Filesystem,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    #[clap(short, long, value_enum)]
    kind: KindArg,
    #[clap(long, default_value = "all")]
    group: String,
    #[clap(long)]
    device: Option<String>,
    #[clap(long, value_delimiter = ',')]
    commands: Option<Vec<String>>,
    #[clap(long, default_value = "tcp")]
    protocol: String,
    #[clap(long)]
    address_family: Option<String>,
    #[clap(long, default_value = "ext4")]
    fs_type: String,
    #[clap(long, value_parser)]
    kernel_image: PathBuf,
    #[clap(long, value_parser)]
    work_dir: Option<PathBuf>,
    /// Campaign duration in seconds.
    #[clap(short, long)]
    duration: Option<u64>,
    #[clap(long)]
    fault_injection: bool,
}

impl RunArgs {
    fn strategy(&self) -> Result<FuzzingStrategy, anyhow::Error> {
        let mut strategy = match self.kind {
            KindArg::Syscall => syscall_strategy(&self.group),
            KindArg::Ioctl => {
                let device = self
                    .device
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("--device is required for ioctl campaigns"))?;
                ioctl_strategy(device, self.commands.as_deref())
            }
            KindArg::Network => network_strategy(&self.protocol, self.address_family.as_deref()),
            KindArg::Filesystem => filesystem_strategy(&self.fs_type),
        };
        if matches!(self.kind, KindArg::Syscall) && strategy.interfaces.is_empty() {
            warn!(
                group = %self.group,
                "unknown syscall group, engine will use its default syscall set"
            );
        }
        if let Some(duration) = self.duration {
            strategy = strategy.with_max_execution_time(duration);
        }
        if self.fault_injection {
            strategy = strategy.with_fault_injection(true);
        }
        Ok(strategy)
    }
}

fn load_config(config_file: Option<PathBuf>) -> Result<SupervisorConfig, anyhow::Error> {
    match config_file {
        Some(config_path) => {
            info!(path = ?config_path, "loading configuration");
            SupervisorConfig::load_from_file(&config_path)
        }
        None => {
            let default_config_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if default_config_path.exists() {
                info!(path = ?default_config_path, "loading default configuration");
                SupervisorConfig::load_from_file(&default_config_path)
            } else {
                info!("no configuration file found, using built-in defaults");
                Ok(SupervisorConfig::default())
            }
        }
    }
}

fn run_campaign(config: SupervisorConfig, args: RunArgs) -> Result<(), anyhow::Error> {
    let strategy = args.strategy()?;
    let supervisor = CampaignSupervisor::new(config);

    let started = supervisor.start_campaign(strategy, &args.kernel_image, args.work_dir)?;
    info!(
        campaign_id = %started.campaign_id,
        work_dir = %started.work_dir,
        "campaign started"
    );

    let campaign = supervisor
        .wait_campaign(&started.campaign_id)
        .ok_or_else(|| anyhow::anyhow!("campaign {} vanished", started.campaign_id))?;
    let report = supervisor.generate_report(&campaign);
    println!("{}", serde_json::to_string_pretty(&report)?);

    if campaign.status == CampaignStatus::Error {
        anyhow::bail!(
            "campaign failed: {}",
            campaign.error_message.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn classify(log: PathBuf) -> Result<(), anyhow::Error> {
    let bytes = std::fs::read(&log)
        .map_err(|e| anyhow::anyhow!("Failed to read log file at {:?}: {}", log, e))?;
    let log_text = String::from_utf8_lossy(&bytes);
    let classifier = CrashClassifier::new();

    let Some(detection) = classifier.detect(&log_text) else {
        println!("{}", serde_json::json!({ "crash": null }));
        return Ok(());
    };
    let stack_trace = classifier.extract_stack_trace(&log_text);
    let affected_function = stack_trace
        .as_deref()
        .and_then(|trace| classifier.extract_affected_function(trace));
    let output = serde_json::json!({
        "crash": detection,
        "title": classifier.extract_title(&log_text, detection.matched_pattern),
        "stack_trace": stack_trace,
        "affected_function": affected_function,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn minimize(
    input: PathBuf,
    file_template: Option<String>,
    timeout_ms: u64,
    command: Vec<String>,
) -> Result<(), anyhow::Error> {
    let bytes = std::fs::read(&input)
        .map_err(|e| anyhow::anyhow!("Failed to read reproducer at {:?}: {}", input, e))?;
    let reproducer = String::from_utf8_lossy(&bytes).into_owned();

    let validator = CommandValidator::new(CommandValidatorConfig {
        command,
        input_delivery: match file_template {
            Some(template) => InputDelivery::File(template),
            None => InputDelivery::StdIn,
        },
        timeout: Duration::from_millis(timeout_ms),
        working_dir: None,
    });

    if !validator.is_crashing(&reproducer) {
        warn!("original reproducer does not crash under the given command");
    }

    let minimized = ReproducerMinimizer::new().minimize(&reproducer, &validator);
    info!(
        original_len = reproducer.len(),
        minimized_len = minimized.len(),
        "minimization finished"
    );
    println!("{minimized}");
    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("KERNFUZZ_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            let config = load_config(cli.config_file)?;
            run_campaign(config, args)
        }
        Commands::Classify { log } => classify(log),
        Commands::Minimize {
            input,
            file_template,
            timeout_ms,
            command,
        } => minimize(input, file_template, timeout_ms, command),
    }
}

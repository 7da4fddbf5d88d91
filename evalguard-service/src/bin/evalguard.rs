use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::eyre;
use color_eyre::Result;
use evalguard_crypto::{EnvelopeCipher, MasterKey};
use evalguard_privacy::SystemClock;
use evalguard_service::config::{load_config, Config, ConfigFormat};
use evalguard_service::platform::Platform;
use evalguard_service::store::{DocumentStore, MemoryStore, ENROLLMENTS};
use evalguard_service::submission::{EvaluationSubmission, Ratings};
use serde_json::json;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "evalguard",
    version,
    about = "Privacy tooling for anonymous course evaluations"
)]
struct Cli {
    /// Path to configuration file (TOML or YAML). Defaults apply when omitted.
    #[arg(long, env = "EVALGUARD_CONFIG")]
    config: Option<PathBuf>,
    /// Explicit configuration format override.
    #[arg(long, value_enum, default_value_t = ConfigFormat::Auto)]
    config_format: ConfigFormat,
    /// Emit logs as JSON lines.
    #[arg(long)]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print a fresh 256-bit master key as hex.
    GenKey,
    /// Audit a freshly configured deployment and print the report.
    Audit,
    /// Print the differential-privacy budget status.
    Budget,
    /// Submit a sample evaluation against an in-memory store.
    Demo {
        /// Skip the anti-correlation delay.
        #[arg(long)]
        no_delay: bool,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(cli.json);

    let config = match &cli.config {
        Some(path) => load_config(path, cli.config_format)?,
        None => Config::sample(),
    };

    match cli.command {
        Command::GenKey => println!("{}", MasterKey::generate().to_hex()),
        Command::Audit => {
            let platform = Platform::new(&config, Arc::new(MemoryStore::new()))?;
            let report = platform.run_privacy_audit().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Budget => {
            let platform = Platform::new(&config, Arc::new(MemoryStore::new()))?;
            println!("{}", serde_json::to_string_pretty(&platform.budget_status())?);
        }
        Command::Demo { no_delay } => run_demo(config, no_delay).await?,
    }
    Ok(())
}

async fn run_demo(mut config: Config, no_delay: bool) -> Result<()> {
    if no_delay {
        config.anonymity.delay_min_secs = 0;
        config.anonymity.delay_max_secs = 0;
    }
    let mut cipher = config.encryption.cipher()?;
    if !cipher.is_configured() {
        warn!("no master key configured, using an ephemeral key for the demo");
        cipher = EnvelopeCipher::new(MasterKey::generate());
    }

    let store = Arc::new(MemoryStore::new());
    store
        .insert_one(
            ENROLLMENTS,
            json!({
                "_id": "enr-demo-1",
                "courseId": "course-101",
                "teacherId": "teacher-7",
                "hasSubmitted": false,
                "submissionTokenUsed": false,
            }),
        )
        .await?;
    let platform = Platform::assemble(&config, store, cipher, Arc::new(SystemClock));

    let ratings: Ratings = serde_json::from_value(json!({
        "teaching": { "clarity": 5, "preparation": 5 },
        "classroomManagement": { "punctuality": 4 },
        "studentEngagement": { "participation": 4 },
    }))?;
    let submission =
        EvaluationSubmission::new(ratings).with_comments("Great teacher, very organized");

    let first = platform
        .submissions()
        .submit_evaluation("enr-demo-1", submission.clone(), Some("203.0.113.77"))
        .await;
    let receipt = first
        .receipt
        .clone()
        .ok_or_else(|| eyre!("demo submission failed: {}", first.message))?;
    println!("submitted: {} (receipt {receipt})", first.message);

    let second = platform
        .submissions()
        .submit_evaluation("enr-demo-1", submission, Some("203.0.113.77"))
        .await;
    println!("resubmitted: success={} message={}", second.success, second.message);

    let report = platform.run_privacy_audit().await?;
    println!(
        "audit: {:?} ({} critical, {} warnings)",
        report.conclusion, report.summary.critical, report.summary.warnings
    );
    Ok(())
}

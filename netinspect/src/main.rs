use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{LevelFilter, error, info};

use netinspect::{InspectionConfig, Orchestrator, SmtpNotifier, load_inventory};

/// Inspect every device in an inventory and archive the evidence.
#[derive(Debug, Parser)]
#[command(name = "netinspect", version, about)]
struct Cli {
    /// JSON device inventory
    #[arg(short, long, env = "NETINSPECT_INVENTORY")]
    inventory: PathBuf,

    /// TOML configuration file
    #[arg(short, long, env = "NETINSPECT_CONFIG")]
    config: Option<PathBuf>,

    /// Override the number of concurrent inspections
    #[arg(short, long)]
    workers: Option<usize>,

    /// Override the output directory
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, conflicts_with = "quiet")]
    verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    fn log_level(&self) -> LevelFilter {
        match (self.quiet, self.verbose) {
            (true, _) => LevelFilter::Warn,
            (false, 0) => LevelFilter::Info,
            (false, 1) => LevelFilter::Debug,
            (false, _) => LevelFilter::Trace,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Missing .env is fine
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let mut logger = env_logger::Builder::new();
    logger.filter_level(cli.log_level());
    if std::env::var_os("RUST_LOG").is_some() {
        logger.parse_default_env();
    }
    logger.init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> netinspect::Result<()> {
    let mut config = InspectionConfig::load(cli.config.as_deref())?;
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Some(output) = cli.output {
        config.output_root = output;
    }
    config.validate()?;

    let devices = load_inventory(&cli.inventory).await?;
    info!(
        "Loaded {} devices from {}",
        devices.len(),
        cli.inventory.display()
    );

    let smtp = config.notify.smtp.clone();
    let mut orchestrator = Orchestrator::new(config);
    if let Some(smtp) = smtp {
        info!("Mailing the report via {}:{}", smtp.server, smtp.port);
        orchestrator = orchestrator.with_notifier(Arc::new(SmtpNotifier::new(&smtp)));
    }

    let report = orchestrator.run(devices).await?;
    println!("{report}");
    Ok(())
}

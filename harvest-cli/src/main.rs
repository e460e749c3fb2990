mod cli;
mod config;
mod error;

use std::process;
use std::sync::Arc;

use clap::Parser;
use harvest_engine::{
    AcquisitionOutcome, Aes128CbcDecryptor, HlsHarvester, SegmentKey, TracingSink,
};
use tracing::{Level, error, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::{
    cli::Args,
    config::FileConfig,
    error::{AppError, Result},
};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = run(args).await {
        error!("{}", e);
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    init_logging(args.verbose, args.quiet);

    let file = FileConfig::load(args.config.as_deref())?;
    let config = file.merge_with(&args)?;

    let mut harvester = HlsHarvester::new(config, Arc::new(TracingSink));
    if let (Some(key), Some(iv)) = (&args.key, &args.iv) {
        let key = SegmentKey::from_hex(key, iv)?;
        harvester = harvester.with_decryptor(Arc::new(Aes128CbcDecryptor), key);
    }

    let token = harvester.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping job");
            token.cancel();
        }
    });

    match harvester.run(&args.url, &args.output).await {
        AcquisitionOutcome::Completed(report) => {
            info!(
                output = %report.output.display(),
                merged = report.segments_merged,
                found = report.segments_found,
                degraded = report.degraded,
                "Finished"
            );
            Ok(())
        }
        AcquisitionOutcome::Failed { kind, reason } => Err(AppError::JobFailed {
            kind: kind.to_string(),
            reason,
        }),
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_level(verbose))
        .init();
}

use clap::Parser;
use mimalloc::MiMalloc;
use scaffold_markdup::cli;
use scaffold_markdup::error::exit_code_for;
use scaffold_markdup::SystemRunner;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() -> ExitCode {
    let args = cli::Args::parse();

    // Initialize tracing subscriber
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            if args.quiet {
                EnvFilter::new("warn")
            } else {
                EnvFilter::new("info")
            }
        });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();

    let result = args
        .into_config()
        .and_then(|config| scaffold_markdup::run(&config, &SystemRunner));
    match result {
        Ok(summary) => {
            tracing::info!(
                output_bam = %summary.output_bam.display(),
                scaffolds = summary.scaffolds,
                workers = summary.workers,
                "scaffold-markdup: processing complete"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

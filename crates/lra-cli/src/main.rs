use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "lra-fetch",
    version,
    about = "Collect results from a batch of distributed LRA benchmark runs"
)]
struct Cli {
    /// Root directory holding one subdirectory of runs per attention mechanism
    #[arg(short = 'c', long)]
    checkpoint_path: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let reference = lra_report::ReferenceTable::lra_defaults();

    let mut matrix = lra_report::collect_results(&cli.checkpoint_path, &reference)?;
    info!(
        "collected results: {}",
        serde_json::to_string_pretty(&matrix)?
    );

    lra_report::aggregate(&mut matrix);
    print!("{}", lra_report::render_report(&matrix));
    Ok(())
}

use cc_testbed::config::ExperimentParams;
use cc_testbed::config::cli::CliOpt;
use cc_testbed::simulation;
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let params = ExperimentParams::from_cli(CliOpt::parse())?;
    let outcome = simulation::run(&params)?;
    tracing::debug!(
        events = outcome.run.events_fired,
        end = %outcome.run.end_time,
        "experiment done"
    );

    Ok(())
}

use clap::Parser;
use p2_aggregator::{AggregatorSettings, CliArgs, LoggingConfig, init_logging, run};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let logging_config = LoggingConfig::from_env();
    let _guard = init_logging(logging_config)?;

    let cli = CliArgs::parse();
    let settings = AggregatorSettings::from_args(&cli)?;

    // Validate configuration before touching any repository (fail-fast)
    settings.validate()?;

    run(settings, cli.command).await
}

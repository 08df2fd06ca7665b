mod cli;

use clap::Parser;

use cli::Cli;
use streamforge::config;
use streamforge::controller::{Controller, RunOptions};
use streamforge::error::{Error, Result};
use streamforge::tools::Binaries;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Respect RUST_LOG if set; default to info-level progress output.
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    if let Err(e) = run(cli).await {
        tracing::error!("{e}");
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    if cli.setup {
        let (dir, entries) = Binaries::bundled_status();
        tracing::info!("Bundled binaries directory: {}", dir.display());
        for (name, present) in entries {
            if present {
                tracing::info!("  {name}: found");
            } else {
                tracing::info!("  {name}: missing; place a static build here");
            }
        }
        return Ok(());
    }

    if cli.test_assets {
        tracing::info!("Fixture media belongs in the test-assets directory next to the test suite.");
        return Ok(());
    }

    let input_config_path = cli
        .input_config
        .ok_or_else(|| Error::missing("command line", "--input-config"))?;
    let pipeline_config_path = cli
        .pipeline_config
        .ok_or_else(|| Error::missing("command line", "--pipeline-config"))?;

    if let Some(url) = cli.cloud_url.as_deref() {
        if !url.starts_with("gs://") && !url.starts_with("s3://") {
            return Err(Error::malformed(
                "command line",
                "--cloud-url",
                "only gs:// and s3:// URLs are supported",
            ));
        }
    }

    let input_config = config::load_input_config(&input_config_path)?;
    let pipeline_config = config::load_pipeline_config(&pipeline_config_path)?;
    let bitrate_config = config::load_bitrate_config(cli.bitrate_config.as_deref())?;

    let options = RunOptions {
        output_location: cli.output,
        cloud_url: cli.cloud_url,
        check_deps: !cli.skip_deps_check,
        use_system_binaries: cli.use_system_binaries,
    };

    let mut controller =
        Controller::build(input_config, pipeline_config, bitrate_config, options).await?;

    let outcome = tokio::select! {
        result = controller.run() => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };

    match outcome {
        Some(result) => result,
        None => {
            tracing::info!("Interrupted; stopping all nodes");
            controller.stop().await;
            Ok(())
        }
    }
}

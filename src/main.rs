//! CLI entry point for deepvarwt-rs.

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use deepvarwt_rs::{DeepVarConfig, Result, Trainer};

#[derive(Parser)]
#[command(name = "deepvarwt")]
#[command(about = "Two-phase LSTM time-varying VAR with trend")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: String,
    },
    /// Run both training phases
    Train {
        /// Path to configuration file
        config: String,
        /// Override the output directory
        #[arg(long)]
        output_dir: Option<String>,
    },
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "config.yaml")]
        output: String,
        /// Preset (quarterly-macro, bivariate)
        #[arg(long, default_value = "quarterly-macro")]
        preset: String,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config);
            let config = DeepVarConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!(
                "  Model: {} layer(s), hidden {}",
                config.model.num_layers, config.model.hidden_dim
            );
            println!("  Series: {}, VAR order: {}", config.model.m, config.model.order);
            println!(
                "  Iterations: {} trend, {} likelihood",
                config.training.iterations_trend, config.training.iterations_ar
            );
        }
        Commands::Train { config, output_dir } => {
            tracing::info!("Starting training with config: {}", config);
            let mut config = DeepVarConfig::from_file(&config)?;
            if let Some(dir) = output_dir {
                config.output_dir = dir;
            }
            config.validate()?;

            let mut trainer = Trainer::new(config)?;
            let outcome = trainer.train()?;
            println!(
                "✓ Fit complete at phase 2 iteration {}{}",
                outcome.stop_iteration,
                if outcome.early_stopped { " (early stop)" } else { "" }
            );
            println!("  Checkpoint: {}", outcome.checkpoint.display());
        }
        Commands::Init { output, preset } => {
            tracing::info!("Generating config for preset: {}", preset);
            let config = DeepVarConfig::from_preset(&preset)?;
            config.to_file(&output)?;
            println!("✓ Configuration written to: {output}");
        }
    }

    Ok(())
}

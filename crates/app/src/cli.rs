use anyhow::Result;
use clap::{Parser, Subcommand};
use ml_core::ObstacleClass;
use vision::{VisionCliArgs, VisionConfig};

/// Live obstacle-detection frame server.
#[derive(Debug, Parser)]
#[command(name = "cane-vision", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Accept camera frames and serve the live view.
    Serve(VisionCliArgs),
    /// Print the obstacle class table.
    Classes,
}

pub fn handle_command(command: Command) -> Result<()> {
    match command {
        Command::Serve(args) => vision::run(VisionConfig::try_from(args)?),
        Command::Classes => {
            for class in ObstacleClass::ALL {
                println!(
                    "{:>2}  {}  {}",
                    class.id(),
                    class.code(),
                    class.description()
                );
            }
            Ok(())
        }
    }
}

mod commands;

use clap::{Parser, Subcommand};
use commands::{
    handle_cidata_command, handle_net_command, handle_usernet_command, CidataCommands,
    NetCommands, UsernetCommands,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "skiff")]
#[command(about = "Skiff CLI - manage local VM boot data and networks")]
struct Cli {
    /// Data directory holding keys, network config, and instances
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate and inspect cloud-init boot data
    #[command(subcommand)]
    Cidata(CidataCommands),
    /// Manage shared network daemons
    #[command(subcommand)]
    Net(NetCommands),
    /// Run the user-mode network gateway
    #[command(subcommand)]
    Usernet(UsernetCommands),
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => default_data_dir()?,
    };

    match cli.command {
        Commands::Cidata(cmd) => handle_cidata_command(&data_dir, cmd).await?,
        Commands::Net(cmd) => handle_net_command(&data_dir, cmd)?,
        Commands::Usernet(cmd) => handle_usernet_command(cmd).await?,
    }

    Ok(())
}

fn default_data_dir() -> Result<PathBuf, Box<dyn std::error::Error>> {
    let home = std::env::var("HOME").map_err(|_| "HOME is not set")?;
    Ok(PathBuf::from(home).join(".skiff"))
}

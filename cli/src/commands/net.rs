use clap::Subcommand;
use skiff_network::daemon::{self, DaemonKind};
use skiff_network::reconcile;
use std::path::Path;

#[derive(Subcommand)]
pub enum NetCommands {
    /// Converge network daemons with the set of running instances
    Reconcile {
        /// Instance about to start, counted as running
        #[arg(long)]
        candidate: Option<String>,
    },
    /// Start the daemons of one named network
    Start {
        /// Network name
        network: String,
    },
    /// Stop the daemons of one named network
    Stop {
        /// Network name
        network: String,
    },
    /// Print the sudoers file the daemons require
    Sudoers,
}

pub fn handle_net_command(
    data_dir: &Path,
    cmd: NetCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = skiff_network::config::load(&data_dir.join("networks.yaml"))?;
    match cmd {
        NetCommands::Reconcile { candidate } => {
            let instances_dir = data_dir.join("instances");
            let failures =
                reconcile::reconcile(&config, &instances_dir, candidate.as_deref());
            if !failures.is_empty() {
                let detail: Vec<String> = failures
                    .iter()
                    .map(|(name, e)| format!("{}: {}", name, e))
                    .collect();
                return Err(format!("reconciliation failed: {}", detail.join("; ")).into());
            }
        }
        NetCommands::Start { network } => {
            // The bridge dials the switch socket, so the switch goes first.
            daemon::start(&config, &network, DaemonKind::Switch)?;
            daemon::start(&config, &network, DaemonKind::Bridge)?;
        }
        NetCommands::Stop { network } => {
            daemon::stop(&config, &network, DaemonKind::Bridge)?;
            daemon::stop(&config, &network, DaemonKind::Switch)?;
        }
        NetCommands::Sudoers => {
            print!("{}", daemon::sudoers_content(&config));
        }
    }
    Ok(())
}

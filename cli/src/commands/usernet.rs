use clap::Subcommand;
use skiff_usernet::leases::parse_mac;
use skiff_usernet::{Endpoints, Runtime, UsernetConfig};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum UsernetCommands {
    /// Serve the gateway until interrupted
    Run {
        /// Datagram socket for a directly attached VMM
        #[arg(long)]
        datagram_socket: PathBuf,

        /// Stream socket handing a connected datagram fd to each client
        #[arg(long)]
        fd_socket: PathBuf,

        /// HTTP control socket
        #[arg(long)]
        http_socket: PathBuf,

        /// /24 network the gateway serves
        #[arg(long, default_value_t = skiff_network::config::USERNET_SUBNET)]
        subnet: Ipv4Addr,

        /// Guest-facing MTU
        #[arg(long, default_value_t = 1500)]
        mtu: u16,

        /// Static lease as mac=ip, repeatable
        #[arg(long = "lease", value_name = "MAC=IP")]
        leases: Vec<String>,
    },
}

pub async fn handle_usernet_command(
    cmd: UsernetCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    match cmd {
        UsernetCommands::Run {
            datagram_socket,
            fd_socket,
            http_socket,
            subnet,
            mtu,
            leases,
        } => {
            let config = UsernetConfig {
                subnet,
                mtu,
                static_leases: parse_static_leases(&leases)?,
                ..UsernetConfig::default()
            };
            let endpoints = Endpoints {
                datagram_socket,
                fd_socket,
                http_socket,
            };
            let runtime = Runtime::start(config, endpoints).await?;
            tokio::signal::ctrl_c().await?;
            tracing::info!("interrupt received, shutting down");
            runtime.shutdown().await;
        }
    }
    Ok(())
}

fn parse_static_leases(
    specs: &[String],
) -> Result<BTreeMap<String, Ipv4Addr>, Box<dyn std::error::Error>> {
    let mut leases = BTreeMap::new();
    for spec in specs {
        let (mac, ip) = spec
            .split_once('=')
            .ok_or_else(|| format!("lease {:?} is not mac=ip", spec))?;
        // Malformed MACs fail at startup, not at DHCP time.
        parse_mac(mac)?;
        leases.insert(mac.to_ascii_lowercase(), ip.parse::<Ipv4Addr>()?);
    }
    Ok(leases)
}

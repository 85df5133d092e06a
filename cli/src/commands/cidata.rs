use clap::{Args, Subcommand};
use skiff_cidata::args::{BuildParams, ResolvedUser, TemplateArgs};
use skiff_cidata::assemble::{self, AssembleParams};
use skiff_cidata::env::{host_proxy_settings, SystemResolver};
use skiff_cidata::image;
use skiff_cidata::render::{self, TemplateSource};
use skiff_config::InstanceConfig;
use std::path::{Path, PathBuf};

#[derive(Subcommand)]
pub enum CidataCommands {
    /// Generate the boot-data image for an instance
    Generate {
        #[command(flatten)]
        common: CidataArgs,

        /// Write a plain directory tree instead of an ISO image
        #[arg(long)]
        dir: bool,

        /// Guest agent binary to embed; a .gz suffix is decompressed
        #[arg(long)]
        guest_agent: Option<PathBuf>,

        /// Container runtime bundle, embedded when containerd is enabled
        #[arg(long)]
        nerdctl_archive: Option<PathBuf>,
    },
    /// Print the cloud-config document that generate would embed
    Preview {
        #[command(flatten)]
        common: CidataArgs,
    },
}

#[derive(Args)]
pub struct CidataArgs {
    /// Instance directory
    instance_dir: PathBuf,

    /// Instance name (defaults to the directory name)
    #[arg(long)]
    name: Option<String>,

    /// Instance config file (defaults to skiff.yaml in the instance dir)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Template directory overriding the embedded templates
    #[arg(long)]
    templates: Option<PathBuf>,

    /// Also authorize every *.pub key under ~/.ssh
    #[arg(long)]
    collect_host_ssh_keys: bool,

    /// Host-side UDP port of the DNS handler, 0 when disabled
    #[arg(long, default_value_t = 0)]
    udp_dns_port: u16,

    /// Host-side TCP port of the DNS handler, 0 when disabled
    #[arg(long, default_value_t = 0)]
    tcp_dns_port: u16,

    /// Guest agent vsock port
    #[arg(long, default_value_t = 2222)]
    vsock_port: u32,
}

pub async fn handle_cidata_command(
    data_dir: &Path,
    cmd: CidataCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    match cmd {
        CidataCommands::Generate {
            common,
            dir,
            guest_agent,
            nerdctl_archive,
        } => {
            let (config, args) = build_args(data_dir, &common)?;
            let source = template_source(&common);
            let assemble_params = AssembleParams {
                guest_agent,
                nerdctl_archive,
            };
            let entries =
                assemble::generate(&source, &args, &config.provision, &assemble_params)?;
            if dir {
                let target = common.instance_dir.join("cidata");
                image::write_dir(&entries, &args.ssh_keys, &target)?;
                println!("{}", target.display());
            } else {
                let target = common.instance_dir.join("cidata.iso");
                image::write_iso(&entries, &target)?;
                println!("{}", target.display());
            }
        }
        CidataCommands::Preview { common } => {
            let (_, args) = build_args(data_dir, &common)?;
            print!("{}", render::render_cloud_config_only(&args)?);
        }
    }
    Ok(())
}

fn template_source(common: &CidataArgs) -> TemplateSource {
    match &common.templates {
        Some(dir) => TemplateSource::Dir(dir.clone()),
        None => TemplateSource::Embedded,
    }
}

fn build_args(
    data_dir: &Path,
    common: &CidataArgs,
) -> Result<(InstanceConfig, TemplateArgs), Box<dyn std::error::Error>> {
    let name = match &common.name {
        Some(name) => name.clone(),
        None => common
            .instance_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or("instance directory has no name")?,
    };
    let config = match &common.config {
        Some(path) => InstanceConfig::load(path)?,
        None => {
            let path = common.instance_dir.join("skiff.yaml");
            if path.exists() {
                InstanceConfig::load(&path)?
            } else {
                InstanceConfig::default_template()?
            }
        }
    };

    let home = std::env::var("HOME").map_err(|_| "HOME is not set")?;
    let network_config = skiff_network::config::load(&data_dir.join("networks.yaml"))?;
    let params = BuildParams {
        home_dir: PathBuf::from(home),
        config_dir: data_dir.to_path_buf(),
        collect_host_ssh_keys: common.collect_host_ssh_keys,
        host_user: ResolvedUser::from_host()?,
        network_config: Some(network_config),
        udp_dns_local_port: common.udp_dns_port,
        tcp_dns_local_port: common.tcp_dns_port,
        vsock_port: common.vsock_port,
        resolv_conf: PathBuf::from("/etc/resolv.conf"),
        process_env: std::env::vars().collect(),
        system_proxy_env: host_proxy_settings()?,
    };
    let args = TemplateArgs::build(
        &common.instance_dir,
        &name,
        &config,
        &params,
        &SystemResolver,
    )?;
    Ok((config, args))
}

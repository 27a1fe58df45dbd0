use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "qemu-compose",
    version,
    about = "A docker-compose equivalent for QEMU VMs",
    long_about = "qemu-compose orchestrates QEMU virtual machines from a declarative YAML configuration."
)]
pub struct Cli {
    /// Alternate compose file (default: qemu-compose.yaml or qemu-compose.yml)
    #[arg(short = 'f', long = "file", global = true)]
    pub file: Option<PathBuf>,

    /// Enable debug logging (also: QEMU_COMPOSE_DEBUG=true)
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create and start VMs
    Up(VmSelectionArgs),
    /// Stop VMs without removing instance disks
    Stop(VmSelectionArgs),
    /// Stop and remove VMs and their instance disks
    Destroy(VmSelectionArgs),
    /// List VMs and their status
    Ps(PsArgs),
    /// Display detailed information about a VM
    Inspect(InspectArgs),
    /// Download VM images to the local cache
    Pull(PullArgs),
    /// Check system dependencies
    Doctor,
    /// Attach to a VM's serial console (Ctrl+] detaches)
    Console(NameArgs),
    /// Connect to a VM via SSH
    Ssh(NameArgs),
    /// Manage cached images
    Image(ImageArgs),
    /// Manage network infrastructure
    Network(NetworkArgs),
    /// Display version information
    Version,
}

#[derive(Args, Debug)]
pub struct VmSelectionArgs {
    /// VM names (all VMs when empty)
    pub vms: Vec<String>,
}

#[derive(Args, Debug)]
pub struct NameArgs {
    /// VM name
    pub vm: String,
}

#[derive(Args, Debug)]
pub struct PsArgs {
    /// Wait for all VMs to be ready before displaying status
    #[arg(long)]
    pub wait: bool,
}

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// VM name
    pub vm: String,

    /// Output format: text or json
    #[arg(long, default_value = "text")]
    pub format: String,
}

#[derive(Args, Debug)]
pub struct PullArgs {
    /// VM names (all VMs when empty)
    pub vms: Vec<String>,

    /// Re-download even if the image is already cached
    #[arg(long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct ImageArgs {
    #[command(subcommand)]
    pub cmd: ImageCommands,
}

#[derive(Subcommand, Debug)]
pub enum ImageCommands {
    /// List cached images
    Ls,
}

#[derive(Args, Debug)]
pub struct NetworkArgs {
    #[command(subcommand)]
    pub cmd: NetworkCommands,
}

#[derive(Subcommand, Debug)]
pub enum NetworkCommands {
    /// List network information
    Ls,
    /// Destroy network infrastructure
    Down(NetworkDownArgs),
}

#[derive(Args, Debug)]
pub struct NetworkDownArgs {
    /// Network names (all networks when empty)
    pub networks: Vec<String>,

    /// Skip the confirmation prompt
    #[arg(long)]
    pub force: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn parses_up_with_vm_selection() {
        let cli = Cli::try_parse_from(["qemu-compose", "up", "web", "api"]).unwrap();
        match cli.cmd {
            Commands::Up(args) => assert_eq!(args.vms, vec!["web", "api"]),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_global_file_flag_after_subcommand() {
        let cli = Cli::try_parse_from(["qemu-compose", "ps", "-f", "other.yaml"]).unwrap();
        assert_eq!(cli.file.unwrap(), PathBuf::from("other.yaml"));
    }

    #[test]
    fn parses_nested_subcommands() {
        let cli = Cli::try_parse_from(["qemu-compose", "network", "down", "frontend", "--force"])
            .unwrap();
        match cli.cmd {
            Commands::Network(NetworkArgs {
                cmd: NetworkCommands::Down(args),
            }) => {
                assert_eq!(args.networks, vec!["frontend"]);
                assert!(args.force);
            }
            other => panic!("unexpected command: {other:?}"),
        }

        let cli = Cli::try_parse_from(["qemu-compose", "image", "ls"]).unwrap();
        assert!(matches!(
            cli.cmd,
            Commands::Image(ImageArgs {
                cmd: ImageCommands::Ls
            })
        ));
    }

    #[test]
    fn inspect_defaults_to_text_format() {
        let cli = Cli::try_parse_from(["qemu-compose", "inspect", "web"]).unwrap();
        match cli.cmd {
            Commands::Inspect(args) => {
                assert_eq!(args.vm, "web");
                assert_eq!(args.format, "text");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn inspect_requires_a_vm() {
        assert!(Cli::try_parse_from(["qemu-compose", "inspect"]).is_err());
    }
}

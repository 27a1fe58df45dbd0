use anyhow::Result;
use clap::Parser;
use qemu_compose::cli::{self, Commands, ImageCommands, NetworkCommands};
use qemu_compose::commands;
use tracing::error;
use tracing_subscriber::EnvFilter;

fn debug_env_enabled() -> bool {
    std::env::var("QEMU_COMPOSE_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    // Default to warnings so tables stay clean; --debug or
    // QEMU_COMPOSE_DEBUG raises it, RUST_LOG overrides everything.
    let default_level = if cli.debug || debug_env_enabled() {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(default_level.into()))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let file = cli.file.as_deref();

    let result = match cli.cmd {
        Commands::Up(args) => commands::cmd_up(file, args).await,
        Commands::Stop(args) => commands::cmd_stop(file, args).await,
        Commands::Destroy(args) => commands::cmd_destroy(file, args).await,
        Commands::Ps(args) => commands::cmd_ps(file, args).await,
        Commands::Inspect(args) => commands::cmd_inspect(file, args).await,
        Commands::Pull(args) => commands::cmd_pull(file, args).await,
        Commands::Doctor => commands::cmd_doctor().await,
        Commands::Console(args) => commands::cmd_console(file, args).await,
        Commands::Ssh(args) => commands::cmd_ssh(file, args).await,
        Commands::Image(args) => match args.cmd {
            ImageCommands::Ls => commands::cmd_image_ls(),
        },
        Commands::Network(args) => match args.cmd {
            NetworkCommands::Ls => commands::cmd_network_ls(file).await,
            NetworkCommands::Down(down) => commands::cmd_network_down(file, down).await,
        },
        Commands::Version => {
            commands::cmd_version();
            Ok(())
        }
    };

    if let Err(e) = &result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }

    result
}

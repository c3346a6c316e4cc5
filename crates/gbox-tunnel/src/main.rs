mod gbox;

use clap::{Parser, Subcommand};

use crate::gbox::app::{Command, GlobalOpts};

#[derive(Debug, Parser)]
#[command(
    name = "gbox-tunnel",
    version,
    about = "Expose TCP ports of a remote gbox on localhost over one multiplexed WebSocket"
)]
struct Cli {
    /// Config file (.toml/.yaml/.yml). If omitted, auto-detects gbox-tunnel.toml > .yaml > .yml in the CWD, then the user config dir. A missing file means defaults.
    #[arg(long, env = "GBOX_TUNNEL_CONFIG", global = true)]
    config: Option<std::path::PathBuf>,

    /// Gbox API base URL.
    #[arg(long, env = "GBOX_BASE_URL", global = true)]
    base_url: Option<String>,

    /// Gbox API key.
    #[arg(long, env = "GBOX_API_KEY", global = true, hide_env_values = true)]
    api_key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Expose the box's ADB port (5555) on localhost.
    Start {
        box_id: String,
        /// Local port (default 5555).
        #[arg(long, short)]
        port: Option<u16>,
        /// Run in this process instead of in the background.
        #[arg(long)]
        foreground: bool,
    },
    /// Expose arbitrary box ports: `[local:]remote`, e.g. `8080` or `18080:8080`.
    PortForward {
        box_id: String,
        #[arg(required = true, num_args = 1..)]
        ports: Vec<String>,
        #[arg(long)]
        foreground: bool,
    },
    /// Stop every tunnel of a box.
    Stop { box_id: String },
    /// List running tunnels, cleaning up stale records.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Kill one tunnel process by PID.
    Kill { pid: u32 },
}

impl From<Commands> for Command {
    fn from(c: Commands) -> Self {
        match c {
            Commands::Start {
                box_id,
                port,
                foreground,
            } => Command::Start {
                box_id,
                port,
                foreground,
            },
            Commands::PortForward {
                box_id,
                ports,
                foreground,
            } => Command::PortForward {
                box_id,
                ports,
                foreground,
            },
            Commands::Stop { box_id } => Command::Stop { box_id },
            Commands::List { json } => Command::List { json },
            Commands::Kill { pid } => Command::Kill { pid },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let global = GlobalOpts {
        config: cli.config,
        base_url: cli.base_url,
        api_key: cli.api_key,
    };
    gbox::run(global, cli.command.into()).await
}

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "echo-bot")]
#[command(about = "Echo bot webhook relay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Run the bot (POST /api/messages, GET /health, GET /). Credentials come from MicrosoftAppId, MicrosoftAppPassword and ManagedIdentityClientId.
    Serve {
        /// Config file path (default: ECHO_BOT_CONFIG_PATH or ~/.echo-bot/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Bind address (default from HOST, config, or 0.0.0.0)
        #[arg(long)]
        host: Option<String>,

        /// HTTP port (default from PORT, config, or 8000)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Check the authentication settings and try to obtain a token.
    Diagnose {
        /// Config file path (default: ECHO_BOT_CONFIG_PATH or ~/.echo-bot/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = match cli.command {
        Some(Commands::Serve { .. }) => "info",
        _ => "warn",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    match cli.command {
        Some(Commands::Version) => {
            println!("echo-bot {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Serve { config, host, port }) => {
            if let Err(e) = run_serve(config, host, port).await {
                log::error!("serve failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Diagnose { config }) => match run_diagnose(config).await {
            Ok(true) => {}
            Ok(false) => std::process::exit(1),
            Err(e) => {
                log::error!("diagnose failed: {:#}", e);
                std::process::exit(1);
            }
        },
        None => {
            println!("Run with --help for usage");
        }
    }
}

async fn run_serve(
    config_path: Option<std::path::PathBuf>,
    host: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let (mut config, path) = echo_relay::config::load_config(config_path)?;
    if let Some(h) = host {
        config.server.host = h;
    }
    if let Some(p) = port {
        config.server.port = p;
    }
    log::info!(
        "starting echo bot on {} (config: {})",
        config.server.bind_addr(),
        path.display()
    );
    echo_relay::gateway::run_server(config).await
}

async fn run_diagnose(config_path: Option<std::path::PathBuf>) -> anyhow::Result<bool> {
    let (config, _) = echo_relay::config::load_config(config_path)?;
    let diagnosis = echo_relay::diagnose::run_diagnostics(&config).await;
    for line in &diagnosis.lines {
        println!("{}", line);
    }
    Ok(diagnosis.healthy)
}

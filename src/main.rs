use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use relaygate::app::{App, Role};
use relaygate::config;
use relaygate::proxy::shadow::crypto::list_ciphers;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "relaygate", about = "Tunneling proxy: plaintext edge, encrypted exit", disable_version_flag = true)]
struct Cli {
    /// Run the exit (server) role; default is the edge (client) role
    #[arg(short = 's', long = "server")]
    server: bool,

    /// Root path of configuration
    #[arg(short = 'c', long = "conf", default_value = "./conf")]
    conf_root: String,

    /// Directory for the log file; stdout when unset
    #[arg(short = 'l', long = "log-dir")]
    log_dir: Option<String>,

    /// Show debug log (otherwise >= info)
    #[arg(short = 'd', long = "debug")]
    debug: bool,

    /// Show version and exit
    #[arg(short = 'v', long = "version")]
    version: bool,
}

fn init_logging(cli: &Cli) -> anyhow::Result<()> {
    let default_level = if cli.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match &cli.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(Path::new(dir).join("relaygate.log"))?;
            let file = Arc::new(file);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(move || file.clone())
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.version {
        println!("relaygate {}", VERSION);
        println!("ciphers: {}", list_ciphers().join(", "));
        return;
    }

    if let Err(e) = init_logging(&cli) {
        eprintln!("relaygate: log init failed: {}", e);
        std::process::exit(1);
    }

    let role = if cli.server { Role::Exit } else { Role::Edge };
    info!(version = VERSION, role = ?role, "relaygate starting");

    let conf_path = config::config_path(&cli.conf_root, cli.server);
    let conf = match config::load_config(&conf_path) {
        Ok(c) => c,
        Err(e) => {
            error!(path = %conf_path.display(), error = %e, "config load failed");
            std::process::exit(1);
        }
    };

    let app = match App::new(role, &conf) {
        Ok(a) => a,
        Err(e) => {
            error!(error = %e, "initialization failed");
            std::process::exit(1);
        }
    };

    if let Err(e) = app.run().await {
        error!(error = %e, "server terminated");
        std::process::exit(1);
    }
}

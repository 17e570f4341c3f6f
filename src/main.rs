use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sockpty::config::{Cli, Command};
use sockpty::{client, server};
use sockpty_core::paths::Rendezvous;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse_args();

    // Setup logging
    setup_logging(cli.debug);

    // Resolve the rendezvous address once, up front
    let rendezvous = Rendezvous::resolve(cli.socket_dir.clone());

    let handshake_timeout = cli.handshake_timeout();

    match cli.command {
        Command::Serve => server::run(rendezvous, handshake_timeout).await,
        Command::Exec { args } => {
            let code = client::run(rendezvous, args, handshake_timeout).await?;
            std::process::exit(code);
        }
    }
}

fn setup_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("sockpty=debug")
    } else {
        EnvFilter::new("sockpty=info")
    };

    // Logs go to stderr; stdout belongs to the relayed terminal stream.
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

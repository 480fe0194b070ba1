//! toolhub CLI binary entry point.

use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

use toolhub::cli::commands;
use toolhub::cli::{Cli, Commands};

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("toolhub=info,warn"));
    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse_args();
    init_tracing(cli.log_json);

    let config = match commands::load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Servers(args) => commands::handle_servers(&config, args.command),
        Commands::Tools => commands::handle_tools(config).await,
        Commands::Call(args) => commands::handle_call(config, args).await,
        Commands::Health => commands::handle_health(config).await,
        Commands::Config(args) => commands::handle_config(&config, args),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

//! Entrypoint of the pgwatch binary

use dotenvy::dotenv;
use tracing_subscriber::EnvFilter;

mod commands {
    pub(crate) mod common;
    pub(crate) mod init;
    pub(crate) mod listen;
    pub(crate) mod notify;
}

/// Reported to Postgres as `application_name`
pub(crate) const APP_NAME: &str = "pgwatch";

enum ReturnCode {
    Failure = 1,
}

#[derive(Debug, clap::Parser)]
#[clap(
    name = "pgwatch",
    version,
    about = "Postgres LISTEN/NOTIFY listener with replay of missed notifications",
    long_about = r#"Postgres LISTEN/NOTIFY listener with replay of missed notifications

Examples:
    # Create the outbox table notifications are recorded in
    pgwatch init --dsn postgresql://postgres@localhost:5432/postgres

    # Log every notification sent on the orders and users channels
    pgwatch listen --dsn postgresql://postgres@localhost:5432/postgres --channels orders,users

    # Keep progress across restarts and log at debug level
    pgwatch listen -v --channels orders --checkpoint-file /var/lib/pgwatch/checkpoints

    # Send a notification through the outbox
    pgwatch notify orders '{"table": "orders", "action": "INSERT", "id": 1}'
"#
)]
struct Config {
    #[clap(flatten)]
    logging: LoggingConfig,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, clap::Parser)]
struct LoggingConfig {
    /// Logs: filter directive, e.g. `info,pgwatch_listener=debug`.
    #[clap(long = "log-filter", env = "LOG_FILTER", global = true, action)]
    log_filter: Option<String>,

    /// Logs: more verbose output, `-v` for debug and `-vv` for trace. Overrides `--log-filter`.
    #[clap(
        short = 'v',
        long = "verbose",
        global = true,
        action = clap::ArgAction::Count,
    )]
    verbose: u8,
}

#[derive(Debug, clap::Parser)]
enum Command {
    /// Create the outbox table
    Init(commands::init::Config),

    /// Listen on channels and log every notification
    Listen(commands::listen::Config),

    /// Send one notification
    Notify(commands::notify::Config),
}

#[tokio::main]
async fn main() {
    // load all environment variables from .env before doing anything
    load_dotenv();

    let config: Config = clap::Parser::parse();
    init_logs(&config.logging);

    match config.command {
        None => println!("command required, -h/--help for help"),
        Some(Command::Init(config)) => {
            if let Err(e) = commands::init::command(config).await {
                eprintln!("Init command failed: {e}");
                std::process::exit(ReturnCode::Failure as _)
            }
        }
        Some(Command::Listen(config)) => {
            if let Err(e) = commands::listen::command(config).await {
                eprintln!("Listen command failed: {e}");
                std::process::exit(ReturnCode::Failure as _)
            }
        }
        Some(Command::Notify(config)) => {
            if let Err(e) = commands::notify::command(config).await {
                eprintln!("Notify command failed: {e}");
                std::process::exit(ReturnCode::Failure as _)
            }
        }
    }
}

/// Source the .env file before initialising the Config struct. Existing environment variables
/// take precedence.
fn load_dotenv() {
    match dotenv() {
        Ok(_) => {}
        Err(dotenvy::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            eprintln!("FATAL Error loading config from: {e}");
            eprintln!("Aborting");
            std::process::exit(ReturnCode::Failure as _);
        }
    };
}

fn log_filter(config: &LoggingConfig) -> Result<EnvFilter, tracing_subscriber::filter::ParseError> {
    match (config.verbose, config.log_filter.as_deref()) {
        (0, Some(filter)) => EnvFilter::try_new(filter),
        (0, None) => EnvFilter::try_new("info"),
        (1, _) => EnvFilter::try_new("debug"),
        _ => EnvFilter::try_new("trace"),
    }
}

fn init_logs(config: &LoggingConfig) {
    let filter = match log_filter(config) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("Initializing logs failed: {e}");
            std::process::exit(ReturnCode::Failure as _);
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

use clap::Parser as _;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};
use vrc_explorer::commands;

const LOG_ENV: &str = "VRC_EXPLORER_LOG";

#[derive(clap::Parser)]
#[clap(version, about, author)]
enum Commands {
    Scan(commands::scan::Args),
    Read(commands::read::Args),
    Write(commands::write::Args),
    Schema(commands::schema::Args),
}

fn end<E: std::error::Error>(r: Result<(), E>) {
    std::process::exit(match r {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            let mut cause = e.source();
            while let Some(e) = cause {
                eprintln!("  because: {e}");
                cause = e.source();
            }
            1
        }
    });
}

fn main() {
    let filter_description = std::env::var(LOG_ENV).unwrap_or_else(|_| "info".to_string());
    let filter = match filter_description.parse::<tracing_subscriber::filter::targets::Targets>() {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("error: {LOG_ENV} is not a valid filter: {e}");
            std::process::exit(2);
        }
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
    match Commands::parse() {
        Commands::Scan(args) => end(commands::scan::run(args)),
        Commands::Read(args) => end(commands::read::run(args)),
        Commands::Write(args) => end(commands::write::run(args)),
        Commands::Schema(args) => end(commands::schema::run(args)),
    }
}

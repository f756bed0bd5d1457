use clap::Parser as _;
use procon_ip_tools::commands;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

const LOG_ENV: &str = "PROCON_IP_TOOLS_LOG";

#[derive(clap::Parser)]
#[clap(version, about, author)]
enum Commands {
    Read(commands::read::Args),
    Relay(commands::relay::Args),
    Dosage(commands::dosage::Args),
    Timer(commands::timer::Args),
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
    let filter = match std::env::var(LOG_ENV)
        .as_deref()
        .unwrap_or("info")
        .parse::<tracing_subscriber::filter::targets::Targets>()
    {
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
        Commands::Read(args) => end(commands::read::run(args)),
        Commands::Relay(args) => end(commands::relay::run(args)),
        Commands::Dosage(args) => end(commands::dosage::run(args)),
        Commands::Timer(args) => end(commands::timer::run(args)),
    }
}

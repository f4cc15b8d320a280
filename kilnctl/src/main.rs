use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

mod commands;

#[derive(Parser)]
#[command(name = "kilnctl", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command inside a working container
    Run(commands::run::RunArgs),
    /// Show the recorded history of a working container
    History(commands::history::HistoryArgs),
    /// Print version and exit
    Version,
}

fn init_tracing() {
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.cmd {
        Commands::Run(args) => {
            let code = commands::run::execute(args);
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::History(args) => commands::history::execute(args)?,
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
        }
    }
    Ok(())
}

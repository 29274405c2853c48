use {
    structopt::StructOpt,
    tracing_subscriber::{filter::LevelFilter, EnvFilter},
};

use zeekat::{cli::Cli, master, slave};

#[tokio::main]
pub async fn main() {
    let cli = Cli::from_args();

    if let Cli::Version = cli {
        println!("zeekat {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    // Logs go to stderr: stdout belongs to the session in netcat mode.
    let default_level = if cli.verbose() {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(default_level.into()))
        .with_writer(std::io::stderr)
        .init();

    let result = match cli {
        Cli::Master(cli) => master::run(cli).await,
        Cli::Slave(cli) => slave::run(cli).await,
        Cli::Version => unreachable!("handled above"),
    };

    // Exit explicitly: a blocked stdin read would otherwise keep the
    // runtime from shutting down after the session is over.
    match result {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            eprintln!("Error: {error:?}");
            std::process::exit(1);
        }
    }
}

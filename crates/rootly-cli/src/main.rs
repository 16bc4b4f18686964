//! rootly CLI binary entrypoint.

use std::io;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use rootly_cli::cli::{Cli, Commands};
use rootly_cli::commands::{CaCommand, CertCommand, UploadCommand};
use rootly_cli::output::OutputFormat;
use rootly_pki::{Pki, PkiConfig};

fn main() -> ExitCode {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

fn run(cli: &Cli) -> Result<(), rootly_cli::CliError> {
    let config = PkiConfig::new(cli.ca_dir.clone(), cli.certs_dir.clone())
        .with_lock_timeout(Duration::from_secs(cli.timeout));
    let pki = Pki::new(config);
    let format = OutputFormat::new(cli.format);
    let mut stdout = io::stdout().lock();

    match &cli.command {
        Commands::Ca { command } => CaCommand::new(&pki).execute(&mut stdout, &format, command),
        Commands::Cert { command } => CertCommand::new(&pki).execute(&mut stdout, &format, command),
        Commands::Upload(args) => UploadCommand::new(&pki).execute(&mut stdout, &format, args),
    }
}

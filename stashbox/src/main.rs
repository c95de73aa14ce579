use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Command, arg, command, crate_name, value_parser};

mod cli;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = build_cli().get_matches();

    if let Some(version_matches) = cli.subcommand_matches(cli::VERSION_SUBCOMMAND) {
        cli::version::run(version_matches.get_flag("json"));
    } else if cli.subcommand_matches(cli::BUGREPORT_SUBCOMMAND).is_some() {
        cli::bugreport::run();
    } else if let Some(server_matches) = cli.subcommand_matches(cli::SERVER_SUBCOMMAND) {
        if let Err(e) = cli::server::run(server_matches).await {
            eprintln!("stashbox server failed: {e}");
            return ExitCode::FAILURE;
        }
    }
    ExitCode::SUCCESS
}

fn build_cli() -> Command {
    command!(crate_name!())
        .version(clap::crate_version!())
        .about(clap::crate_description!())
        .subcommand(
            Command::new(cli::VERSION_SUBCOMMAND)
                .about(cli::VERSION_DESCRIPTION)
                .arg(arg!(--json "Print as JSON")),
        )
        .subcommand(Command::new(cli::BUGREPORT_SUBCOMMAND).about(cli::BUGREPORT_DESCRIPTION))
        .subcommand(
            Command::new(cli::SERVER_SUBCOMMAND)
                .about(cli::SERVER_DESCRIPTION)
                .arg(
                    arg!(-p --port <PORT>)
                        .required(false)
                        .value_parser(value_parser!(u16))
                        .help("Port to listen on. Overrides STASHBOX_PORT"),
                )
                .arg(
                    arg!(-d --"data-dir" <DIR>)
                        .required(false)
                        .value_parser(value_parser!(PathBuf))
                        .help("Directory of the database file. Overrides STASHBOX_DATA_DIR"),
                )
                .arg(
                    arg!(--"sweep-interval" <SECONDS>)
                        .required(false)
                        .value_parser(value_parser!(u64))
                        .help("Seconds between expired file sweeps. Overrides STASHBOX_SWEEP_INTERVAL_SECS"),
                ),
        )
        .arg_required_else_help(true)
        .disable_version_flag(true)
}

use std::path::PathBuf;
use std::time::Duration;

use clap::ArgMatches;
use server::Config;

/// Command line values win over the environment.
pub(crate) fn config(matches: &ArgMatches) -> Config {
    let mut config = Config::from_env();
    if let Some(port) = matches.get_one::<u16>("port") {
        config.port = *port;
    }
    if let Some(dir) = matches.get_one::<PathBuf>("data-dir") {
        config.data_dir.clone_from(dir);
    }
    if let Some(secs) = matches.get_one::<u64>("sweep-interval") {
        config.sweep_interval = Duration::from_secs(*secs);
    }
    config
}

pub async fn run(matches: &ArgMatches) -> Result<(), server::error::Error> {
    server::run(config(matches)).await
}

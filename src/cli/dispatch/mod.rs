use crate::{
    cli::{
        actions::{server::Args, Action},
        commands::{ARG_CONFIG, ARG_PORT},
    },
    config::{Config, DEFAULT_CONFIG_PATH},
};
use anyhow::Result;
use std::path::PathBuf;

/// # Errors
/// Returns an error if the configuration file cannot be loaded.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let config_path = PathBuf::from(
        matches
            .get_one::<String>(ARG_CONFIG)
            .map_or(DEFAULT_CONFIG_PATH, String::as_str),
    );
    let config = Config::load(&config_path)?;

    let port = matches
        .get_one::<u16>(ARG_PORT)
        .copied()
        .unwrap_or(config.server.port);

    Ok(Action::Server(Args {
        config_path,
        port,
        config,
    }))
}

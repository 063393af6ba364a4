use crate::cli::{actions::Action, commands, dispatch, telemetry};
use anyhow::Result;
use clap::{parser::ValueSource, ArgMatches};

/// Map verbosity to a tracing level; `None` defers to `logging.level`.
fn get_verbosity_level(matches: &ArgMatches) -> Option<tracing::Level> {
    let verbosity = matches
        .get_one::<u8>(commands::logging::ARG_VERBOSITY)
        .copied()
        .unwrap_or(0);
    let from_env =
        matches.value_source(commands::logging::ARG_VERBOSITY) == Some(ValueSource::EnvVariable);

    match verbosity {
        0 if from_env => Some(tracing::Level::ERROR),
        0 => None,
        1 => Some(tracing::Level::WARN),
        2 => Some(tracing::Level::INFO),
        3 => Some(tracing::Level::DEBUG),
        _ => Some(tracing::Level::TRACE),
    }
}

/// Main entry point for the CLI - builds and returns the Action
///
/// # Errors
///
/// Returns an error if argument parsing, configuration loading or telemetry
/// initialization fails
pub fn start() -> Result<Action> {
    let matches = commands::new().get_matches();

    let verbosity_level = get_verbosity_level(&matches);

    // The configuration carries the logging defaults, so load it first.
    let action = dispatch::handler(&matches)?;

    let Action::Server(args) = &action;
    telemetry::init(telemetry::Options::new(
        verbosity_level,
        &args.config.logging,
        args.config.env,
    ))?;

    Ok(action)
}

mod pipelines;

use std::path::Path;

use anyhow::{Context, Result};
use brigade_engine::{ChefSettings, load_settings, load_settings_from};
use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use tracing::{Level, debug};

fn main() -> Result<()> {
    init_tracing();
    let matches = cli().get_matches();
    let settings = settings(&matches)?;
    debug!(?settings, "settings resolved");

    match matches.subcommand() {
        Some(("countdown", sub)) => run_countdown(settings, sub),
        Some(("relay", sub)) => run_relay(settings, sub),
        _ => {
            println!("Available subcommands: countdown, relay");
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_max_level(Level::INFO)
        .try_init();
}

fn cli() -> Command {
    Command::new("brigade")
        .about("Run the built-in brigade pipelines")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .action(ArgAction::Set)
                .global(true)
                .help("Path to a YAML or JSON settings file"),
        )
        .subcommand(
            Command::new("countdown")
                .about("Count down in a repeated sub-recipe")
                .arg(
                    Arg::new("from")
                        .long("from")
                        .action(ArgAction::Set)
                        .value_parser(value_parser!(i64))
                        .default_value("5")
                        .help("Starting value"),
                )
                .arg(
                    Arg::new("repeat")
                        .long("repeat")
                        .action(ArgAction::Set)
                        .value_parser(value_parser!(u32))
                        .help("Fixed number of iterations; counts down to zero when omitted"),
                ),
        )
        .subcommand(
            Command::new("relay")
                .about("Pass a baton between coroutine steps")
                .arg(
                    Arg::new("fibers")
                        .long("fibers")
                        .action(ArgAction::Set)
                        .value_parser(value_parser!(u32))
                        .default_value("3")
                        .help("Number of coroutine steps"),
                )
                .arg(
                    Arg::new("rounds")
                        .long("rounds")
                        .action(ArgAction::Set)
                        .value_parser(value_parser!(u32))
                        .default_value("2")
                        .help("Turns each coroutine takes"),
                ),
        )
}

fn settings(matches: &ArgMatches) -> Result<ChefSettings> {
    match matches.get_one::<String>("config") {
        Some(path) => load_settings_from(Path::new(path)).with_context(|| format!("loading settings from {path}")),
        None => load_settings().context("loading settings"),
    }
}

fn run_countdown(settings: ChefSettings, m: &ArgMatches) -> Result<()> {
    let from = m.get_one::<i64>("from").copied().unwrap_or(5);
    let repeat = m.get_one::<u32>("repeat").copied();
    let report = pipelines::countdown(settings, from, repeat)?;
    let out = serde_json::json!({
        "from": report.from,
        "remaining": report.remaining,
        "ticks": report.ticks,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn run_relay(settings: ChefSettings, m: &ArgMatches) -> Result<()> {
    let fibers = m.get_one::<u32>("fibers").copied().unwrap_or(3);
    let rounds = m.get_one::<u32>("rounds").copied().unwrap_or(2);
    let baton = pipelines::relay(settings, fibers, rounds)?;
    let out = serde_json::json!({
        "fibers": fibers,
        "rounds": rounds,
        "baton": baton,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

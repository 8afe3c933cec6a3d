use anyhow::{Context, anyhow};
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::{error, info, warn};
use std::path::Path;
use std::time::{Duration, Instant};
use std::{panic, process};

use crate::config::{Properties, PushConfig};
use crate::pipeline::status::{Recv, StatusChannel, StatusMessage};
use crate::pipeline::PushCoordinator;

pub mod capture;
pub mod config;
pub mod encoder;
pub mod pipeline;
pub mod sink;

fn main() {
    tracing_subscriber::fmt::init();

    let matches = Command::new(config::app_name())
        .version(config::version())
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file with flat key/value properties."),
        )
        .arg(
            Arg::new("url")
                .short('u')
                .long("url")
                .value_name("URL")
                .help("Push destination, e.g. push://host:port/name."),
        )
        .arg(
            Arg::new("set")
                .short('s')
                .long("set")
                .value_name("KEY=VALUE")
                .action(ArgAction::Append)
                .help("Override a single configuration property."),
        )
        .arg(
            Arg::new("duration")
                .short('d')
                .long("duration")
                .value_name("SECONDS")
                .help("Stop streaming after this many seconds."),
        )
        .get_matches();

    // kill the main thread as soon as a secondary thread panics
    let orig_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        // invoke the default handler and exit the process
        orig_hook(panic_info);
        process::exit(105);
    }));

    let status = StatusChannel::new(64);

    // gracefully close the pipeline when receiving SIGINT, SIGTERM, or SIGHUP
    let ctrl_status = status.clone();
    ctrlc::set_handler(move || {
        ctrl_status.abort();
    })
    .expect("Error setting Ctrl-C handler");

    if let Err(e) = run(&matches, status) {
        error!("{:#}", e);
        process::exit(1);
    }
}

fn run(matches: &ArgMatches, status: StatusChannel) -> anyhow::Result<()> {
    let mut properties = match matches.get_one::<String>("config") {
        Some(path) => Properties::from_json_file(Path::new(path))?,
        None => Properties::new(),
    };
    if let Some(url) = matches.get_one::<String>("url") {
        properties.set("push_url", url.clone());
    }
    if let Some(duration) = matches.get_one::<String>("duration") {
        properties.set("duration", duration.clone());
    }
    if let Some(overrides) = matches.get_many::<String>("set") {
        for entry in overrides {
            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| anyhow!("--set expects KEY=VALUE, got '{}'", entry))?;
            properties.set(key, value);
        }
    }

    let config = PushConfig::from_properties(&properties)?;
    if config.url.is_empty() {
        return Err(anyhow!("no push url configured (use --url or push_url)"));
    }

    let runtime = tokio::runtime::Runtime::new().context("start async runtime")?;
    let mut coordinator = PushCoordinator::init(&config, status.clone(), runtime.handle().clone())?;

    info!("streaming to {} (ctrl-c to stop)", config.url);
    let deadline = config.run_duration.map(|d| Instant::now() + d);

    loop {
        match status.get(Duration::from_millis(1000)) {
            Recv::Message(StatusMessage::FatalError { code, detail }) => {
                error!("pipeline error {}: {}", code, detail);
            }
            Recv::Message(StatusMessage::QueueDurationReport { audio, video }) => {
                warn!("push queue depth: audio {:?}, video {:?}", audio, video);
            }
            Recv::Timeout => {}
            Recv::Aborted => break,
        }

        if deadline.is_some_and(|d| Instant::now() >= d) {
            info!("configured duration reached");
            break;
        }
    }

    coordinator.shutdown();
    Ok(())
}

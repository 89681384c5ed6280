//! Interactive session: wires the coordinator, the location service and the
//! alert channels together and drives them from stdin.
//!
//! Each input line is either a command or a position fix:
//!
//! ```text
//! add <lat> <lon> <radius_m> <name...>    persistent zone
//! once <lat> <lon> <radius_m> <name...>   one-time zone
//! expire <id> <minutes>                   expire a zone after a delay (0 clears)
//! rename <id> <name...>
//! del <id> | rearm <id> | list | where | start | stop | quit
//! find <query>                            coordinates or a name from places.json
//! 43.6532,-79.3832[,accuracy_m]           position fix
//! ```

use chrono::{DateTime, Duration, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, watch};

#[cfg(feature = "audio")]
use crate::core::alerts::dispatch::ToneChannel;
use crate::core::{
    alerts::{
        dispatch::{AlertChannel, AlertDispatcher, BroadcastChannel, LogChannel},
        model::ZoneEvent,
    },
    clock::SessionClock,
    config::ConfigManager,
    coordinator::{self, Collaborators, Coordinator, CoordinatorHandle},
    error::{CoordinatorError, LocationError},
    geo::Coordinate,
    location::{
        model::LocationSample,
        service::{self, LocationHandle},
        source::{ChannelSource, SourceFeed},
    },
    search::{Geocoder, LocalGeocoder},
    sync::{BroadcastSync, SyncMessage},
    zones::{
        model::{ZoneId, ZonePatch, ZoneSpec},
        persist::{JsonFilePersistence, Persistence},
    },
};

const DEFAULT_DATA_DIR: &str = "./geofence-data";
const PLACES_FILE: &str = "places.json";

lazy_static! {
    // "lat,lon" or "lat,lon,accuracy"
    static ref POSITION_LINE: Regex = Regex::new(
        r"^\s*([-+]?\d+(?:\.\d+)?)\s*,\s*([-+]?\d+(?:\.\d+)?)\s*(?:,\s*(\d+(?:\.\d+)?)\s*)?$"
    )
    .expect("Invalid position regex");
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Location(#[from] LocationError),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InputError {
    #[error("unknown command '{0}'")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("'{0}' is not a zone id")]
    BadId(String),
}

/// One parsed stdin line.
#[derive(Debug, Clone, PartialEq)]
enum Input {
    Create(ZoneSpec),
    Update(ZoneId, ZonePatch),
    Delete(ZoneId),
    Rearm(ZoneId),
    List,
    Find(String),
    Where,
    Start,
    Stop,
    Position(LocationSample),
    Quit,
}

pub fn run() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let data_dir = std::env::args()
        .nth(1)
        .map_or_else(|| PathBuf::from(DEFAULT_DATA_DIR), PathBuf::from);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(session(data_dir)) {
        log::error!("Session ended with an error: {}", e);
        std::process::exit(1);
    }
}

async fn session(data_dir: PathBuf) -> Result<(), AppError> {
    log::info!("Using data directory {:?}", data_dir);
    let persistence: Arc<dyn Persistence> = Arc::new(JsonFilePersistence::new(&data_dir));

    let config_manager = ConfigManager::new(Arc::clone(&persistence));
    let settings = config_manager.load();
    // Write back so every tunable shows up in settings.json
    if let Err(e) = config_manager.save(&settings) {
        log::warn!("Could not write settings: {}", e);
    }

    let zones = persistence.load_zones().unwrap_or_else(|e| {
        log::warn!("Could not load zones, starting empty: {}", e);
        Vec::new()
    });
    let geocoder = LocalGeocoder::load(&data_dir.join(PLACES_FILE)).unwrap_or_else(|e| {
        log::warn!("Could not load places: {}", e);
        LocalGeocoder::default()
    });

    let clock = SessionClock::start();

    // Alert channels
    let ui = BroadcastChannel::new(64);
    let ui_events = ui.subscribe();
    #[allow(unused_mut)]
    let mut channels: Vec<Box<dyn AlertChannel>> = vec![Box::new(LogChannel), Box::new(ui)];
    #[cfg(feature = "audio")]
    channels.push(Box::new(ToneChannel::new()));

    let background = Arc::new(BroadcastSync::new(64));
    let background_rx = background.subscribe();
    tokio::spawn(background_context(background_rx));
    tokio::spawn(print_events(ui_events));

    let coordinator = Coordinator::new(zones, &settings, clock.now());
    let (sample_tx, sample_rx) = watch::channel(None);
    let collaborators = Collaborators {
        persistence,
        sync: background,
        alerts: AlertDispatcher::start(channels),
    };
    let (zones, coordinator_task) = coordinator::spawn(coordinator, collaborators, clock, sample_rx);

    let (source, feed) = ChannelSource::channel();
    let (location, location_task) = service::spawn(source, settings.location.clone(), clock, sample_tx);
    location.start().await?;

    println!("Ready. Type a position (lat,lon[,accuracy]) or a command; 'quit' to exit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match parse_input(&line, clock.now()) {
            Ok(Input::Quit) => break,
            Ok(input) => execute(input, &zones, &location, &feed, &geocoder).await?,
            Err(e) => println!("? {}", e),
        }
    }

    location.stop().await?;
    drop(location);
    if let Err(e) = location_task.await {
        log::error!("Location task failed: {}", e);
    }
    zones.shutdown().await?;
    if let Err(e) = coordinator_task.await {
        log::error!("Coordinator task failed: {}", e);
    }
    Ok(())
}

async fn execute(
    input: Input,
    zones: &CoordinatorHandle,
    location: &LocationHandle,
    feed: &SourceFeed,
    geocoder: &dyn Geocoder,
) -> Result<(), AppError> {
    match input {
        Input::Create(spec) => match zones.create_zone(spec).await {
            Ok(zone) => println!("+ {} '{}' ({:?})", zone.id, zone.name, zone.kind),
            Err(CoordinatorError::Zone(e)) => println!("? {}", e),
            Err(e) => return Err(e.into()),
        },
        Input::Update(id, patch) => match zones.update_zone(id, patch).await {
            Ok(zone) => println!("~ {} '{}' expires {:?}", zone.id, zone.name, zone.expires_at),
            Err(CoordinatorError::Zone(e)) => println!("? {}", e),
            Err(e) => return Err(e.into()),
        },
        Input::Delete(id) => {
            if !zones.delete_zone(id).await? {
                println!("? no zone {}", id);
            }
        }
        Input::Rearm(id) => match zones.rearm_zone(id).await {
            Ok(()) => {}
            Err(CoordinatorError::Zone(e)) => println!("? {}", e),
            Err(e) => return Err(e.into()),
        },
        Input::List => {
            let all = zones.zones().await?;
            if all.is_empty() {
                println!("(no zones)");
            }
            for zone in all {
                println!(
                    "  {} {:<20} {} r={}m {:?} {:?}",
                    zone.id, zone.name, zone.center, zone.radius_m, zone.kind, zone.state
                );
            }
        }
        Input::Find(query) => match geocoder.search(&query) {
            Ok(results) => {
                for result in results {
                    println!("  {} ({})", result.display_name, result.coordinate);
                }
            }
            Err(e) => println!("? {}", e),
        },
        Input::Where => {
            let status = location.status();
            match status.last_known {
                Some(sample) => println!(
                    "  {} accuracy {:?} at {} ({:?}, {:?})",
                    sample.coordinate, sample.accuracy_m, sample.timestamp, status.state, status.mode
                ),
                None => println!("  no fix yet ({:?})", status.state),
            }
            if let Some(e) = status.error {
                println!("  location stopped: {}", e);
            }
        }
        Input::Start => location.start().await?,
        Input::Stop => location.stop().await?,
        Input::Position(sample) => {
            if !feed.push(sample) {
                println!("? location watch is not running (try 'start')");
            }
        }
        Input::Quit => {}
    }
    Ok(())
}

fn parse_input(line: &str, now: DateTime<Utc>) -> Result<Input, InputError> {
    if let Some(sample) = parse_position(line, now) {
        return Ok(Input::Position(sample));
    }

    let mut words = line.split_whitespace();
    let command = words.next().unwrap_or_default().to_lowercase();
    let rest: Vec<&str> = words.collect();

    match command.as_str() {
        "add" | "once" => {
            let spec = parse_zone(&rest).ok_or(InputError::Usage("add|once <lat> <lon> <radius_m> <name...>"))?;
            Ok(Input::Create(if command == "once" { spec.one_time() } else { spec }))
        }
        "expire" => {
            let usage = InputError::Usage("expire <id> <minutes>");
            let [id, minutes] = rest.as_slice() else {
                return Err(usage);
            };
            let minutes: i64 = minutes.parse().map_err(|_| usage.clone())?;
            if minutes < 0 {
                return Err(usage);
            }
            let expires_at = (minutes > 0).then(|| now + Duration::minutes(minutes.min(525_600)));
            let patch = ZonePatch {
                expires_at: Some(expires_at),
                ..ZonePatch::default()
            };
            Ok(Input::Update(parse_id(id)?, patch))
        }
        "rename" => {
            let Some((id, name)) = rest.split_first().filter(|(_, name)| !name.is_empty()) else {
                return Err(InputError::Usage("rename <id> <name...>"));
            };
            let patch = ZonePatch {
                name: Some(name.join(" ")),
                ..ZonePatch::default()
            };
            Ok(Input::Update(parse_id(id)?, patch))
        }
        "del" | "delete" => single_id(&rest, "del <id>").map(Input::Delete),
        "rearm" | "reset" => single_id(&rest, "rearm <id>").map(Input::Rearm),
        "find" => Ok(Input::Find(rest.join(" "))),
        "list" | "ls" => Ok(Input::List),
        "where" => Ok(Input::Where),
        "start" => Ok(Input::Start),
        "stop" => Ok(Input::Stop),
        "quit" | "exit" => Ok(Input::Quit),
        other => Err(InputError::Unknown(other.to_string())),
    }
}

fn parse_position(line: &str, now: DateTime<Utc>) -> Option<LocationSample> {
    let caps = POSITION_LINE.captures(line)?;
    let lat = caps.get(1)?.as_str().parse::<f64>().ok()?;
    let lon = caps.get(2)?.as_str().parse::<f64>().ok()?;
    let accuracy = caps.get(3).and_then(|m| m.as_str().parse::<f64>().ok());
    Some(LocationSample::new(Coordinate::new(lat, lon), accuracy, now))
}

fn parse_zone(args: &[&str]) -> Option<ZoneSpec> {
    let [lat, lon, radius, name @ ..] = args else {
        return None;
    };
    if name.is_empty() {
        return None;
    }
    let center = Coordinate::new(lat.parse().ok()?, lon.parse().ok()?);
    Some(ZoneSpec::new(name.join(" "), center, radius.parse().ok()?))
}

fn parse_id(text: &str) -> Result<ZoneId, InputError> {
    text.parse().map_err(|_| InputError::BadId(text.to_string()))
}

fn single_id(args: &[&str], usage: &'static str) -> Result<ZoneId, InputError> {
    match args {
        [id] => parse_id(id),
        _ => Err(InputError::Usage(usage)),
    }
}

fn describe(event: &ZoneEvent) -> String {
    match event {
        ZoneEvent::Triggered(trigger) => format!(
            "!! ARRIVED at '{}' ({:.0} m from center)",
            trigger.zone_name, trigger.distance_m
        ),
        ZoneEvent::Reset { zone_id, .. } => format!("   {} re-armed", zone_id),
        ZoneEvent::Deleted { zone_id, reason, .. } => format!("-  {} deleted ({:?})", zone_id, reason),
        ZoneEvent::Expired { zone_id, .. } => format!("-  {} expired", zone_id),
    }
}

async fn print_events(mut events: broadcast::Receiver<ZoneEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => println!("{}", describe(&event)),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                log::warn!("Missed {} alert(s) on the console", missed);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Stands in for the background execution context.
async fn background_context(mut messages: broadcast::Receiver<SyncMessage>) {
    loop {
        match messages.recv().await {
            Ok(message) => log::debug!("Background context received '{}'", message.event_type),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                log::debug!("Background context skipped {} message(s)", missed);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

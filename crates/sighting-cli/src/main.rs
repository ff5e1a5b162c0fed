use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use sighting_core::{
    EventLog, FaceExtractor, FaceMatch, FaceReport, FrameReport, Identity, LoadStatus, NationalId,
    Registration, RegistrationRequest, Registry, Session,
};
use sighting_io::{read_frame, DetectionFeed, PrecomputedExtractor, ProfileStore};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod watch;

use config::Config;

#[derive(Parser)]
#[command(name = "sighting", about = "Face registry, identification and sighting log")]
struct Cli {
    /// TOML config file (overrides SIGHTING_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Registry directory
    #[arg(long, global = true)]
    registry_dir: Option<PathBuf>,
    /// Sighting log file
    #[arg(long, global = true)]
    events: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register every face in a detection record under a label
    Register {
        /// Identity label (e.g., "maria")
        #[arg(short, long)]
        label: String,
        /// 11-digit national identifier to store with the record
        #[arg(long)]
        national_id: Option<String>,
        /// Distance at or below which a face counts as already registered
        #[arg(long)]
        tolerance: Option<f32>,
        /// Capture this many shots from a JSON-lines stream instead of one record
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
        shots: Option<u32>,
        /// Detection record for one still image ("-" for stdin with --shots)
        detections: PathBuf,
    },
    /// Identify the faces in one still image and log the sightings
    Identify {
        /// Detection record for one still image
        detections: PathBuf,
        /// Identification threshold
        #[arg(long)]
        threshold: Option<f32>,
        /// Profile metadata to attach to identified faces
        #[arg(long)]
        profiles: Option<PathBuf>,
    },
    /// Identify faces continuously from a JSON-lines detection stream
    Watch {
        /// Detection stream, or "-" for stdin
        #[arg(default_value = "-")]
        input: PathBuf,
        /// Time budget in seconds (0 = until the stream ends)
        #[arg(long)]
        duration: Option<u64>,
        /// Stop after this many frames
        #[arg(long)]
        max_frames: Option<u64>,
        /// Identification threshold
        #[arg(long)]
        threshold: Option<f32>,
        /// Seconds between two logged sightings of one identity
        #[arg(long)]
        cooldown: Option<u64>,
    },
    /// List registered identities
    List,
    /// Show the sighting log
    Events {
        /// Only show this identity
        #[arg(long)]
        identity: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(dir) = cli.registry_dir {
        config.registry_dir = dir;
    }
    if let Some(path) = cli.events {
        config.events_path = path;
    }
    tracing::debug!(?config, "configuration resolved");

    match cli.command {
        Commands::Register {
            label,
            national_id,
            tolerance,
            shots,
            detections,
        } => {
            let identity = Identity::new(label).context("invalid label")?;
            let national_id = national_id
                .map(NationalId::new)
                .transpose()
                .context("invalid national id")?;
            let request = RegistrationRequest {
                identity,
                national_id,
            };

            if let Some(shots) = shots {
                let feed = DetectionFeed::open(&detections)?;
                let mut registry = Registry::open(&config.registry_dir)?
                    .with_duplicate_tolerance(tolerance.unwrap_or(config.duplicate_tolerance));
                let enrollment =
                    registry.enroll(&request, &mut PrecomputedExtractor, feed, shots as usize)?;

                for entry in &enrollment.accepted {
                    println!("shot {}: registered as {} ({})", entry.index, entry.identity, entry.file_name());
                }
                println!(
                    "{} of {shots} shot(s) registered from {} frame(s); {} already registered, {} failed",
                    enrollment.accepted.len(),
                    enrollment.frames,
                    enrollment.duplicates,
                    enrollment.failed
                );
                if enrollment.accepted.len() < shots as usize {
                    eprintln!("warning: input ended before {shots} shot(s) were captured");
                }
                return Ok(());
            }

            let frame = read_frame(&detections)?;
            let faces = PrecomputedExtractor.extract(&frame)?;
            let mut registry = Registry::open(&config.registry_dir)?
                .with_duplicate_tolerance(tolerance.unwrap_or(config.duplicate_tolerance));
            let results = registry.register_faces(&request, faces)?;

            let mut accepted = 0;
            for (i, face) in results.iter().enumerate() {
                match &face.outcome {
                    Ok(Registration::Accepted(entry)) => {
                        accepted += 1;
                        println!("face {i}: registered as {} ({})", entry.identity, entry.file_name());
                    }
                    Ok(Registration::RejectedDuplicate { distance }) => {
                        println!("face {i}: already registered (distance {distance:.3}), skipped");
                    }
                    Err(e) => println!("face {i}: failed: {e}"),
                }
            }
            println!("{accepted} of {} face(s) registered", results.len());
        }
        Commands::Identify {
            detections,
            threshold,
            profiles,
        } => {
            let frame = read_frame(&detections)?;
            let profiles = profiles
                .or_else(|| config.profiles_path.clone())
                .map(|path| ProfileStore::load(&path))
                .transpose()?;

            let registry = Registry::open(&config.registry_dir)?;
            let mut events = open_events(&config.events_path);
            let mut session_config = config.session_config();
            if let Some(threshold) = threshold {
                session_config.match_threshold = threshold;
            }

            let mut session = Session::new(
                registry.snapshot(),
                &mut events,
                PrecomputedExtractor,
                session_config,
            )?;
            let report = session.run_single(&frame)?;
            ensure_extracted(&report, &detections)?;

            let faces = report
                .faces
                .iter()
                .map(|face| face_json(face, profiles.as_ref()))
                .collect::<Result<Vec<_>>>()?;
            println!("{}", serde_json::to_string_pretty(&faces)?);
        }
        Commands::Watch {
            input,
            duration,
            max_frames,
            threshold,
            cooldown,
        } => {
            let registry = Registry::open(&config.registry_dir)?;
            let events = open_events(&config.events_path);
            let feed = DetectionFeed::open(&input)?;

            let mut session_config = config.session_config();
            if let Some(secs) = duration {
                session_config.max_elapsed = (secs > 0).then(|| Duration::from_secs(secs));
            }
            if max_frames.is_some() {
                session_config.max_frames = max_frames;
            }
            if let Some(threshold) = threshold {
                session_config.match_threshold = threshold;
            }
            if let Some(secs) = cooldown {
                session_config.cooldown = Duration::from_secs(secs);
            }

            let summary = watch::run(registry, events, feed, session_config).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::List => {
            let registry = Registry::open(&config.registry_dir)?;
            let identities = registry.snapshot().identities();
            if identities.is_empty() {
                println!("No identities registered");
            }
            for (identity, shots) in &identities {
                println!("{identity}  {shots} reference(s)");
            }
        }
        Commands::Events { identity } => {
            let events = open_events(&config.events_path);
            let filter = identity
                .map(Identity::new)
                .transpose()
                .context("invalid identity")?;

            let mut shown = 0;
            for (identity, sightings) in events.iter() {
                if filter.as_ref().is_some_and(|f| f != identity) {
                    continue;
                }
                shown += 1;
                println!("{identity}: {} sighting(s)", sightings.len());
                for at in sightings {
                    let local = at.with_timezone(&chrono::Local);
                    println!("  {}", local.format("%Y-%m-%d %H:%M:%S"));
                }
            }
            if shown == 0 {
                println!("No sightings recorded");
            }
        }
    }

    Ok(())
}

/// Open the sighting log, warning when an unusable file is being replaced.
fn open_events(path: &Path) -> EventLog {
    let (events, status) = EventLog::open(path);
    match &status {
        LoadStatus::Malformed(reason) | LoadStatus::Unreadable(reason) => {
            eprintln!(
                "warning: ignoring sighting log {} ({reason}); it will be replaced on the next sighting",
                path.display()
            );
        }
        LoadStatus::Loaded { .. } | LoadStatus::Missing | LoadStatus::Empty => {}
    }
    events
}

/// A still image whose extraction failed is an error, not an empty result.
fn ensure_extracted(report: &FrameReport, source: &Path) -> Result<()> {
    match &report.skipped {
        Some(e) => Err(anyhow::anyhow!("no faces extracted from {}: {e}", source.display())),
        None => Ok(()),
    }
}

fn face_json(face: &FaceReport, profiles: Option<&ProfileStore>) -> Result<Value> {
    let result = match &face.result {
        Ok(result) => result,
        Err(e) => {
            return Ok(json!({
                "bbox": face.bbox,
                "status": "error",
                "error": e.to_string(),
            }))
        }
    };

    let mut value = serde_json::to_value(FaceMatch {
        bbox: face.bbox,
        result: result.clone(),
    })?;
    if !result.is_known() {
        value["identity"] = json!("unknown");
    }
    value["event"] = json!(face.event);
    if let Some(profile) = result
        .identity()
        .and_then(|identity| profiles.and_then(|p| p.lookup(identity)))
    {
        value["profile"] = profile.clone();
    }
    Ok(value)
}

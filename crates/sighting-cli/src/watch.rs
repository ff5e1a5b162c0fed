use anyhow::{Context, Result};
use sighting_core::{
    EventLog, FrameReport, Registry, RegistrySnapshot, Session, SessionConfig, SessionError,
    SessionSummary, StopFlag,
};
use sighting_io::{DetectionFeed, PrecomputedExtractor};
use std::future::Future;
use std::io::{self, BufRead};
use std::time::Duration;
use tokio::sync::oneshot;

/// How long to wait for the session thread after Ctrl-C.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type Feed = DetectionFeed<Box<dyn BufRead + Send>>;

/// Run a continuous session on a dedicated thread until the feed ends, a
/// budget runs out, or the user interrupts.
pub async fn run(
    registry: Registry,
    events: EventLog,
    feed: Feed,
    config: SessionConfig,
) -> Result<SessionSummary> {
    run_until(registry, events, feed, config, tokio::signal::ctrl_c(), SHUTDOWN_GRACE).await
}

/// Like [`run`], stopping the session when `shutdown` resolves.
///
/// The registry lock stays with the caller and is released on every exit
/// path, including a session thread stuck on blocked input.
async fn run_until<S>(
    registry: Registry,
    events: EventLog,
    feed: Feed,
    config: SessionConfig,
    shutdown: S,
    grace: Duration,
) -> Result<SessionSummary>
where
    S: Future<Output = io::Result<()>>,
{
    let (snapshot, lock) = registry.into_parts();
    let stop = StopFlag::new();
    let mut reply_rx = spawn_session(snapshot, events, feed, config, stop.clone())?;

    let reply = tokio::select! {
        reply = &mut reply_rx => reply,
        signal = shutdown => {
            signal.context("failed to listen for Ctrl-C")?;
            tracing::info!("interrupt received, stopping after the current frame");
            stop.stop();
            match tokio::time::timeout(grace, &mut reply_rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    drop(lock);
                    anyhow::bail!(
                        "session did not stop within {}s (input blocked?); recorded sightings are already saved",
                        grace.as_secs()
                    );
                }
            }
        }
    };
    drop(lock);

    let summary = reply.context("session thread exited without a result")??;
    Ok(summary)
}

fn spawn_session(
    snapshot: RegistrySnapshot,
    mut events: EventLog,
    feed: Feed,
    config: SessionConfig,
    stop: StopFlag,
) -> Result<oneshot::Receiver<Result<SessionSummary, SessionError>>> {
    let (reply_tx, reply_rx) = oneshot::channel();

    std::thread::Builder::new()
        .name("sighting-session".into())
        .spawn(move || {
            tracing::debug!("session thread started");
            let result = Session::new(&snapshot, &mut events, PrecomputedExtractor, config)
                .and_then(|session| session.with_stop_flag(stop).run(feed, print_frame));
            // Receiver is gone only if the caller already gave up waiting.
            let _ = reply_tx.send(result);
            tracing::debug!("session thread exiting");
        })
        .context("failed to spawn session thread")?;

    Ok(reply_rx)
}

fn print_frame(report: &FrameReport) {
    let at = report.observed_at.with_timezone(&chrono::Local);
    for face in &report.faces {
        let (Ok(result), Some(event)) = (&face.result, face.event) else {
            continue;
        };
        let Some(identity) = result.identity() else {
            continue;
        };
        if event.is_recorded() {
            println!(
                "{}  {identity}  distance={:.3}  frame={}",
                at.format("%Y-%m-%d %H:%M:%S"),
                result.distance,
                report.sequence
            );
        }
    }
    if let Some(fps) = report.throughput {
        eprintln!("[{} frames] {fps:.1} fps", report.sequence);
    }
}

//! `knockd server` — engine lifecycle.
//!
//! Wires secrets → sequence window → packet ingress → state machine, then
//! drains knock events on the main thread until shutdown. Ctrl-C flips a
//! flag the ingress loop polls; once ingress drops its channel sender the
//! drain loop finishes and the process exits. The rotator and any pending
//! timers are abandoned at that point — their effects are in-memory only —
//! and in-flight action subprocesses are left to finish.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

use knock_engine::{
    clock, handle_event, Engine, EngineConfig, IngressMetrics, PacketIngress, ShellRunner,
    RING_CAPACITY,
};

use crate::config::DaemonConfig;

pub fn run(config: &DaemonConfig) -> Result<()> {
    let secrets = knock_engine::load_secrets(Path::new(&config.pre_shared_key_directory))?;
    tracing::info!(
        secrets = secrets.len(),
        interface = %config.network_interface,
        "starting knock server"
    );

    let engine = Arc::new(Engine::new(
        EngineConfig {
            success_action: config.success_action.clone(),
            timeout_action: config.timeout_action.clone(),
            grant_timeout: Duration::from_secs(config.timeout_seconds),
            attempt_timeout: knock_engine::ATTEMPT_TIMEOUT,
        },
        secrets,
        Arc::new(ShellRunner),
    ));

    // Sequences must exist before the first packet can match.
    engine
        .extend_window(clock::unix_now())
        .context("failed to generate initial knock sequences")?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            eprintln!("shutdown requested");
            shutdown.store(true, Relaxed);
        })
        .context("failed to install signal handler")?;
    }

    let metrics = IngressMetrics::new();
    let (event_tx, event_rx) = crossbeam_channel::bounded(RING_CAPACITY);
    let mut ingress = PacketIngress::new(
        &config.network_interface,
        event_tx,
        metrics.clone(),
        shutdown.clone(),
    )?;

    let ingress_handle = std::thread::Builder::new()
        .name("knock-ingress".into())
        .spawn(move || ingress.run())
        .expect("failed to spawn ingress thread");

    {
        let engine = engine.clone();
        let shutdown = shutdown.clone();
        std::thread::Builder::new()
            .name("sequence-rotator".into())
            .spawn(move || run_rotator(engine, shutdown))
            .expect("failed to spawn rotator thread");
    }

    // Single consumer: per-source ordering falls out of processing events
    // in arrival order. Ends when ingress drops its sender.
    for event in event_rx {
        handle_event(&engine, event);
    }

    let ingress_result = ingress_handle
        .join()
        .unwrap_or_else(|_| Err(anyhow::anyhow!("ingress thread panicked")));

    let snap = metrics.snapshot();
    tracing::info!(
        frames = snap.frames_received,
        queued = snap.events_queued,
        dropped = snap.events_dropped,
        skipped = snap.frames_skipped,
        "knock server stopped"
    );
    ingress_result
}

/// Keep the acceptance window aligned to the 30-second grid: extend to cover
/// the current slot's neighbours, sleep to the boundary, discard the slot
/// that just fell out of tolerance. Discarding before the next extension is
/// what stops a departing sequence from being consumed after rotation.
fn run_rotator(engine: Arc<Engine>, shutdown: Arc<AtomicBool>) {
    loop {
        if shutdown.load(Relaxed) {
            return;
        }
        if let Err(e) = engine.extend_window(clock::unix_now()) {
            // Only reachable with an unusable secret, which startup rejects.
            tracing::error!("sequence rotation failed: {e:#}");
            return;
        }
        std::thread::sleep(clock::until_next_boundary());
        engine.discard_oldest_slot();
    }
}

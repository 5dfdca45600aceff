//! Per-source knock progress tracking and grant lifecycle.
//!
//! One [`Engine`] owns both concurrently-touched structures — the rotating
//! sequence set and the per-source client map — behind a single coarse lock.
//! Knock rates are tiny next to the lock cost, and the two structures must
//! mutate together anyway: starting an attempt consumes a sequence in the
//! same critical section that records the client.
//!
//! The lock is never held across a sleep or a subprocess. Timers (the 3 s
//! in-progress ceiling, the grant deadline) are named threads that sleep and
//! then take the lock once; each carries the `Instant` of the attempt or
//! grant it was scheduled for and no-ops if a newer one has superseded it.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::dispatch::ActionRunner;
use crate::ingress::KnockEvent;
use crate::otp::{PortSequence, SEQUENCE_LEN};
use crate::secrets::Secret;
use crate::sequence::SequenceSet;

/// How long a partially-completed sequence may sit before its progress is
/// wiped. Keeps a client from staying pinned to a sequence that rotation has
/// already retired.
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(3);

pub struct EngineConfig {
    /// Template run when a knock completes, `%s` ← source address.
    pub success_action: String,
    /// Template run when a grant expires unrefreshed.
    pub timeout_action: String,
    /// Grant lifetime; zero makes success one-shot (no close action).
    pub grant_timeout: Duration,
    /// [`ATTEMPT_TIMEOUT`] in production; tests shrink it.
    pub attempt_timeout: Duration,
}

/// Progress record for one source address.
///
/// Either an attempt is in flight (`progress` 1..=3, `sequence` set) or the
/// record is tracking an active grant (`progress` 0, `last_success` set) —
/// or both, when a granted client is mid-refresh.
struct ClientProgress {
    progress: usize,
    sequence: Option<PortSequence>,
    last_success: Option<Instant>,
    /// Which attempt the pending in-progress timer belongs to.
    attempt_started: Option<Instant>,
}

impl ClientProgress {
    fn idle() -> Self {
        Self {
            progress: 0,
            sequence: None,
            last_success: None,
            attempt_started: None,
        }
    }
}

struct EngineState {
    sequences: SequenceSet,
    clients: HashMap<Ipv4Addr, ClientProgress>,
}

pub struct Engine {
    cfg: EngineConfig,
    runner: Arc<dyn ActionRunner>,
    state: Mutex<EngineState>,
}

enum FollowUp {
    None,
    AttemptStarted(Instant),
    Granted(Instant),
}

/// Feed one knock event through the state machine, spawning whatever timer
/// or dispatch work it triggers. Called from the single ingress drain loop,
/// so events for one source are inherently serialized.
pub fn handle_event(engine: &Arc<Engine>, event: KnockEvent) {
    match engine.advance(event) {
        FollowUp::None => {}
        FollowUp::AttemptStarted(started) => spawn_attempt_timer(engine, event.src_ip, started),
        FollowUp::Granted(granted_at) => complete_grant(engine, event.src_ip, granted_at),
    }
}

impl Engine {
    pub fn new(cfg: EngineConfig, secrets: Vec<Secret>, runner: Arc<dyn ActionRunner>) -> Self {
        Self {
            cfg,
            runner,
            state: Mutex::new(EngineState {
                sequences: SequenceSet::new(secrets),
                clients: HashMap::new(),
            }),
        }
    }

    /// Rotator entry point: cover the slots neighbouring `now_unix`.
    pub fn extend_window(&self, now_unix: u64) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .sequences
            .extend_to_window(now_unix)
    }

    /// Rotator entry point: retire the departed slot.
    pub fn discard_oldest_slot(&self) {
        self.state.lock().unwrap().sequences.discard_oldest();
    }

    /// The locked part of event handling: advance, reset, or start progress.
    fn advance(&self, event: KnockEvent) -> FollowUp {
        let KnockEvent { src_ip, dst_port } = event;
        let mut guard = self.state.lock().unwrap();
        let st = &mut *guard;

        let in_flight = st.clients.get(&src_ip).and_then(|c| {
            if c.progress > 0 {
                c.sequence.map(|seq| (c.progress, seq))
            } else {
                None
            }
        });

        match in_flight {
            Some((progress, sequence)) => {
                if dst_port != sequence[progress] {
                    // Strict reset: the client restarts from a fresh first
                    // port. An existing grant record goes with it; its watch
                    // thread still closes access at the original deadline.
                    st.clients.remove(&src_ip);
                    debug!(client = %src_ip, port = dst_port, "unexpected port, progress reset");
                    return FollowUp::None;
                }

                let progress = progress + 1;
                if progress < SEQUENCE_LEN {
                    if let Some(c) = st.clients.get_mut(&src_ip) {
                        c.progress = progress;
                    }
                    return FollowUp::None;
                }

                // Sequence complete. Keep the record as a grant marker.
                let now = Instant::now();
                if let Some(c) = st.clients.get_mut(&src_ip) {
                    c.progress = 0;
                    c.sequence = None;
                    c.attempt_started = None;
                    c.last_success = Some(now);
                }
                FollowUp::Granted(now)
            }
            None => {
                // Nothing in flight for this source (unknown, or sitting on
                // a grant). Only an unconsumed opening port starts progress.
                let Some((idx, sequence)) = st.sequences.find_unused_starting_with(dst_port)
                else {
                    return FollowUp::None;
                };
                st.sequences.mark_used(idx);

                let started = Instant::now();
                let entry = st.clients.entry(src_ip).or_insert_with(ClientProgress::idle);
                entry.progress = 1;
                entry.sequence = Some(sequence);
                entry.attempt_started = Some(started);
                debug!(client = %src_ip, "knock sequence started");
                FollowUp::AttemptStarted(started)
            }
        }
    }

    /// In-progress timeout. Fires only for the attempt that scheduled it: a
    /// never-granted client is removed outright, a granted one just loses
    /// its partial refresh progress.
    fn attempt_timeout(&self, client: Ipv4Addr, started: Instant) {
        let mut st = self.state.lock().unwrap();
        let Some(c) = st.clients.get_mut(&client) else {
            return;
        };
        if c.attempt_started != Some(started) {
            return;
        }
        if c.last_success.is_none() {
            st.clients.remove(&client);
            debug!(client = %client, "knock attempt timed out");
        } else {
            c.progress = 0;
            c.sequence = None;
            c.attempt_started = None;
            debug!(client = %client, "refresh attempt timed out, grant kept");
        }
    }

    /// Close-action decision at the grant deadline. A grant refreshed since
    /// `granted_at` belongs to a newer watcher; only the watcher that still
    /// sees its own timestamp acts, so exactly one close fires per chain.
    fn grant_expiry(&self, client: Ipv4Addr, granted_at: Instant) {
        {
            let mut st = self.state.lock().unwrap();
            if let Some(c) = st.clients.get(&client) {
                if c.last_success != Some(granted_at) {
                    return;
                }
            }
            st.clients.remove(&client);
        }
        info!(client = %client, "grant expired, closing access");
        self.run_action(&self.cfg.timeout_action, client);
    }

    /// Invoke an action template. Failures are logged with the source and
    /// never retried; the firewall is presumed either changed or not, and a
    /// second attempt could compound the damage.
    fn run_action(&self, template: &str, client: Ipv4Addr) {
        if template.is_empty() {
            debug!(client = %client, "no action configured");
            return;
        }
        if let Err(e) = self.runner.run(template, client) {
            warn!(client = %client, "action failed: {e:#}");
        }
    }
}

fn spawn_attempt_timer(engine: &Arc<Engine>, client: Ipv4Addr, started: Instant) {
    let engine = Arc::clone(engine);
    std::thread::Builder::new()
        .name("knock-attempt".into())
        .spawn(move || {
            std::thread::sleep(engine.cfg.attempt_timeout);
            engine.attempt_timeout(client, started);
        })
        .expect("failed to spawn attempt timer");
}

/// Success: log, open access, and (unless grants are one-shot) watch for the
/// deadline. The open action runs on the caller's thread with no lock held,
/// so a slow firewall command stalls at most the event drain, never a timer.
fn complete_grant(engine: &Arc<Engine>, client: Ipv4Addr, granted_at: Instant) {
    info!(client = %client, "knock sequence completed, opening access");
    engine.run_action(&engine.cfg.success_action, client);

    if engine.cfg.grant_timeout.is_zero() {
        return;
    }
    let engine = Arc::clone(engine);
    std::thread::Builder::new()
        .name("grant-watch".into())
        .spawn(move || {
            std::thread::sleep(engine.cfg.grant_timeout);
            engine.grant_expiry(client, granted_at);
        })
        .expect("failed to spawn grant watcher");
}

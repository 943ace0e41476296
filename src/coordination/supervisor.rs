use super::{CoordinationClient, ConnectionState, MembershipEvent, NodeDescriptor};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

const MAX_RECONNECT_ATTEMPTS: u32 = 10;
const RECONNECT_BACKOFF_BASE: Duration = Duration::from_secs(1);
/// After this many consecutive failed polls in polling mode, treat the
/// coordination client as disconnected and restart from `register`.
const MAX_POLL_FAILURES: u32 = 10;

/// Owns the C3 state machine
/// (`Disconnected -> Connecting -> Connected -> Watching <-> Polling -> Disconnected`)
/// and is the single place membership changes are serialized before they
/// reach the engine, so concurrent add/remove notifications never race.
pub struct MembershipSupervisor {
    state_rx: watch::Receiver<ConnectionState>,
}

impl MembershipSupervisor {
    /// Spawn the supervisor task. Registers `self_descriptor` with `client`,
    /// then drives watch-with-polling-fallback for the lifetime of the
    /// returned receiver; resolved, de-duplicated membership events are
    /// delivered on the returned channel.
    pub fn spawn(
        client: Arc<dyn CoordinationClient>,
        self_descriptor: NodeDescriptor,
        poll_interval: Duration,
    ) -> (Self, mpsc::Receiver<MembershipEvent>) {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (out_tx, out_rx) = mpsc::channel(1024);

        tokio::spawn(run(client, self_descriptor, poll_interval, state_tx, out_tx));

        (MembershipSupervisor { state_rx }, out_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }
}

type WatchRx = mpsc::Receiver<Result<MembershipEvent, crate::error::CoordinationError>>;

async fn run(
    client: Arc<dyn CoordinationClient>,
    self_descriptor: NodeDescriptor,
    poll_interval: Duration,
    state_tx: watch::Sender<ConnectionState>,
    out_tx: mpsc::Sender<MembershipEvent>,
) {
    let mut known: HashMap<String, NodeDescriptor> = HashMap::new();
    let mut attempt: u32 = 0;

    'reconnect: loop {
        let _ = state_tx.send(ConnectionState::Connecting);

        if let Err(e) = client.register(self_descriptor.clone()).await {
            warn!("coordination register failed: {e}");
            if !backoff_or_give_up(&mut attempt, &state_tx).await {
                return;
            }
            continue 'reconnect;
        }

        if resync(&client, &mut known, &out_tx).await.is_err() {
            if !backoff_or_give_up(&mut attempt, &state_tx).await {
                return;
            }
            continue 'reconnect;
        }
        attempt = 0;

        let mut watch_rx: Option<WatchRx> = match client.watch().await {
            Ok(rx) => {
                info!("coordination client watching membership directory");
                Some(rx)
            }
            Err(e) => {
                debug!("watch unavailable ({e}), polling instead");
                None
            }
        };

        let mut poll_failures = 0u32;

        loop {
            match &mut watch_rx {
                Some(rx) => {
                    let _ = state_tx.send(ConnectionState::Watching);
                    match rx.recv().await {
                        Some(Ok(event)) => {
                            apply_event(&mut known, event.clone());
                            if out_tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        Some(Err(e)) => {
                            warn!("watch stream failed, falling back to polling: {e}");
                            watch_rx = None;
                        }
                        None => {
                            warn!("watch stream closed, falling back to polling");
                            watch_rx = None;
                        }
                    }
                }
                None => {
                    let _ = state_tx.send(ConnectionState::Polling);
                    tokio::time::sleep(poll_interval).await;

                    match resync(&client, &mut known, &out_tx).await {
                        Ok(()) => {
                            poll_failures = 0;
                            // Periodically retry establishing the real watch
                            // so polling is only ever a temporary fallback.
                            if let Ok(rx) = client.watch().await {
                                info!("coordination client re-established watch");
                                watch_rx = Some(rx);
                            }
                        }
                        Err(e) => {
                            poll_failures += 1;
                            warn!("poll failed ({e}), {poll_failures}/{MAX_POLL_FAILURES}");
                            if poll_failures >= MAX_POLL_FAILURES {
                                error!("coordination client disconnected after repeated poll failures");
                                if !backoff_or_give_up(&mut attempt, &state_tx).await {
                                    return;
                                }
                                continue 'reconnect;
                            }
                        }
                    }
                }
            }
        }
    }
}

/// On Disconnected, exponential backoff reconnect with a cap. Returns
/// `false` once the cap is exceeded (caller should give up).
async fn backoff_or_give_up(attempt: &mut u32, state_tx: &watch::Sender<ConnectionState>) -> bool {
    *attempt += 1;
    let _ = state_tx.send(ConnectionState::Disconnected);
    if *attempt > MAX_RECONNECT_ATTEMPTS {
        error!("coordination client giving up after {MAX_RECONNECT_ATTEMPTS} reconnect attempts");
        return false;
    }
    let backoff = RECONNECT_BACKOFF_BASE * 2u32.pow((*attempt - 1).min(16));
    tokio::time::sleep(backoff).await;
    true
}

/// Fetch a fresh snapshot and diff it against `known`, synthesizing
/// add/remove events for anything that changed and updating `known` in
/// place. This is what gives polling mode the same at-least-once delivery
/// semantics as a real watch.
async fn resync(
    client: &Arc<dyn CoordinationClient>,
    known: &mut HashMap<String, NodeDescriptor>,
    out_tx: &mpsc::Sender<MembershipEvent>,
) -> Result<(), crate::error::CoordinationError> {
    let fresh = client.members().await?;

    for (id, descriptor) in &fresh {
        if known.get(id) != Some(descriptor) {
            let _ = out_tx.send(MembershipEvent::Add(descriptor.clone())).await;
        }
    }
    for id in known.keys() {
        if !fresh.contains_key(id) {
            let _ = out_tx.send(MembershipEvent::Remove(id.clone())).await;
        }
    }

    *known = fresh;
    Ok(())
}

fn apply_event(known: &mut HashMap<String, NodeDescriptor>, event: MembershipEvent) {
    match event {
        MembershipEvent::Add(descriptor) => {
            known.insert(descriptor.node_id.clone(), descriptor);
        }
        MembershipEvent::Remove(id) => {
            known.remove(&id);
        }
    }
}

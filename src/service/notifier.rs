//! Notification fan-out boundary.
//!
//! Delivery to users is an external collaborator; the forwarder drains the
//! [`EventBus`] and emits one structured log line per event for it.

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::domain::{EventBus, LedgerEvent};

/// Spawns the forwarder. The task ends when `shutdown` flips to `true` or
/// the bus closes, returning the number of events forwarded.
pub fn spawn_forwarder(bus: &EventBus, shutdown: watch::Receiver<bool>) -> JoinHandle<u64> {
    let rx = bus.subscribe();
    tokio::spawn(forward(rx, shutdown))
}

async fn forward(
    mut rx: broadcast::Receiver<LedgerEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> u64 {
    let mut forwarded = 0_u64;
    loop {
        tokio::select! {
            biased;
            event = rx.recv() => {
                match event {
                    Ok(event) => {
                        notify(&event);
                        forwarded = forwarded.saturating_add(1);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(lagged = n, "notification forwarder lagged behind event bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!(forwarded, "notification forwarder stopped");
    forwarded
}

fn notify(event: &LedgerEvent) {
    let payload = serde_json::to_string(event).unwrap_or_default();
    match event.recipient() {
        Some(user_id) => tracing::info!(
            event_type = event.event_type_str(),
            recipient = %user_id,
            %payload,
            "notification"
        ),
        None => tracing::info!(event_type = event.event_type_str(), %payload, "admin notification"),
    }
}

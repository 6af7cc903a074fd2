//! Deferred, coalescing event dispatch.
//!
//! Rapid-fire cache mutations (a patch burst, a hydrated page) would
//! otherwise bubble up as one application event per property write.
//! Events are staged on an internal channel; the dispatcher drains
//! whatever has accumulated by the time it runs and merges same-entity
//! change events into one before broadcasting, so a burst collapses
//! into a single batched notification.

use tokio::sync::{broadcast, mpsc};

use crate::events::ClientEvent;

/// Merge a drained batch: change events for the same entity collapse
/// into one carrying the union of their property lists; everything else
/// passes through in order.
pub fn coalesce(batch: Vec<ClientEvent>) -> Vec<ClientEvent> {
    let mut out: Vec<ClientEvent> = Vec::with_capacity(batch.len());
    for event in batch {
        match &event {
            ClientEvent::ConversationChanged { id, properties } => {
                let merged = out.iter_mut().find_map(|existing| match existing {
                    ClientEvent::ConversationChanged {
                        id: existing_id,
                        properties: existing_properties,
                    } if existing_id == id => Some(existing_properties),
                    _ => None,
                });
                match merged {
                    Some(existing_properties) => merge_properties(existing_properties, properties),
                    None => out.push(event),
                }
            }
            ClientEvent::MessageChanged { id, properties } => {
                let merged = out.iter_mut().find_map(|existing| match existing {
                    ClientEvent::MessageChanged {
                        id: existing_id,
                        properties: existing_properties,
                    } if existing_id == id => Some(existing_properties),
                    _ => None,
                });
                match merged {
                    Some(existing_properties) => merge_properties(existing_properties, properties),
                    None => out.push(event),
                }
            }
            _ => out.push(event),
        }
    }
    out
}

fn merge_properties(existing: &mut Vec<String>, incoming: &[String]) {
    for property in incoming {
        if !existing.contains(property) {
            existing.push(property.clone());
        }
    }
}

/// Spawn the dispatcher: stage events on the returned sender; they are
/// drained, coalesced and broadcast one scheduling tick later.
pub fn spawn_dispatcher(events: broadcast::Sender<ClientEvent>) -> mpsc::Sender<ClientEvent> {
    let (stage_tx, mut stage_rx) = mpsc::channel::<ClientEvent>(256);
    tokio::spawn(async move {
        while let Some(first) = stage_rx.recv().await {
            // Let same-tick senders finish staging before draining.
            tokio::task::yield_now().await;
            let mut batch = vec![first];
            while let Ok(event) = stage_rx.try_recv() {
                batch.push(event);
            }
            for event in coalesce(batch) {
                let _ = events.send(event);
            }
        }
    });
    stage_tx
}

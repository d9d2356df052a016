use crate::engine::{epoch_milli, runs, task_executions};
use crate::storage;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::Display;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace};

/// How many events the in-process broadcast channel buffers before slow subscribers start
/// lagging. Slow subscribers receive a lag error rather than blocking publishers.
const BROADCAST_CAPACITY: usize = 100;

#[derive(Debug, PartialEq, Eq, Display, Serialize, Deserialize, Clone)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    // Namespace events
    CreatedNamespace {
        namespace_id: String,
    },
    DeletedNamespace {
        namespace_id: String,
    },

    // Pipeline events
    CreatedPipeline {
        namespace_id: String,
        pipeline_id: String,
    },
    DeletedPipeline {
        namespace_id: String,
        pipeline_id: String,
    },
    RegisteredPipelineConfig {
        namespace_id: String,
        pipeline_id: String,
        version: u64,
    },
    DeletedPipelineConfig {
        namespace_id: String,
        pipeline_id: String,
        version: u64,
    },

    // Run events
    StartedRun {
        namespace_id: String,
        pipeline_id: String,
        run_id: u64,
    },
    CompletedRun {
        namespace_id: String,
        pipeline_id: String,
        run_id: u64,
        status: runs::Status,
    },
    StartedRunCancellation {
        namespace_id: String,
        pipeline_id: String,
        run_id: u64,

        /// The grace period in seconds task containers get before they are killed. 0 kills
        /// immediately.
        timeout: u64,
    },

    // Task execution events
    CreatedTaskExecution {
        namespace_id: String,
        pipeline_id: String,
        run_id: u64,
        task_execution_id: String,
    },
    StartedTaskExecution {
        namespace_id: String,
        pipeline_id: String,
        run_id: u64,
        task_execution_id: String,
    },
    CompletedTaskExecution {
        namespace_id: String,
        pipeline_id: String,
        run_id: u64,
        task_execution_id: String,
        status: task_executions::Status,
    },

    // Extension events
    InstalledExtension {
        extension_id: String,
        image: String,
    },
    UninstalledExtension {
        extension_id: String,
        image: String,
    },
    SubscribedPipelineExtension {
        namespace_id: String,
        pipeline_id: String,
        extension_id: String,
        subscription_id: String,
    },
    UnsubscribedPipelineExtension {
        namespace_id: String,
        pipeline_id: String,
        extension_id: String,
        subscription_id: String,
    },

    /// A trigger event arrived from an extension's watch endpoint. These are recorded even when
    /// no run is launched for them.
    ReceivedExtensionEvent {
        extension_id: String,
        namespace_id: String,
        pipeline_id: String,
        subscription_id: String,
        result: String,
    },

    /// A trigger event could not be converted into a run.
    FailedRunProcessing {
        extension_id: String,
        namespace_id: String,
        pipeline_id: String,
        description: String,
    },
}

/// A single event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    /// Unique, monotonically increasing identifier; assigned by storage when the event is
    /// persisted. Subscribers always observe events in increasing id order.
    pub id: u64,

    /// The type of event it is.
    pub kind: Kind,

    /// Time the event was emitted in epoch milliseconds.
    pub emitted: u64,
}

impl TryFrom<storage::events::Event> for Event {
    type Error = anyhow::Error;

    fn try_from(value: storage::events::Event) -> Result<Self> {
        let emitted = value.emitted.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'emitted' from storage value '{}'",
                value.emitted
            )
        })?;

        let kind: Kind = serde_json::from_str(&value.kind).with_context(|| {
            format!(
                "Could not parse field 'kind' from storage value '{}'",
                value.kind
            )
        })?;

        Ok(Event {
            id: value.id as u64,
            kind,
            emitted,
        })
    }
}

/// The event bus is the central handler for all things related to events within the application.
/// It allows a subscriber to listen to events and a sender to emit events.
/// This is useful as it provides an internal interface for functions to listen for events.
/// But it's even more powerful when you think of the outside applications that can be written on top.
#[derive(Debug, Clone)]
pub struct EventBus {
    storage: storage::Db,
    broadcast_channel: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(storage: storage::Db, retention: u64, prune_interval: u64) -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);

        let event_bus = Self {
            storage: storage.clone(),
            broadcast_channel: tx,
        };

        tokio::spawn(async move {
            loop {
                match prune_events(&storage, retention).await {
                    Ok(_) => (),
                    Err(e) => {
                        error!(error = %e, "encountered an error during attempt to prune old events")
                    }
                };

                tokio::time::sleep(tokio::time::Duration::from_secs(prune_interval)).await;
            }
        });

        event_bus
    }

    /// Returns a channel receiver end which can be used to listen to events as they are
    /// published. The receiver drops its subscription automatically when it goes out of scope.
    pub fn subscribe_live(&self) -> broadcast::Receiver<Event> {
        self.broadcast_channel.subscribe()
    }

    /// Allows the caller to emit a new event to the event bus. Returns the resulting event, with
    /// its storage assigned id, once it has been successfully published. The event is always
    /// persisted before any live subscriber sees it.
    pub async fn try_publish(&self, kind: Kind) -> Result<Event> {
        let mut new_event = Event {
            id: 0,
            kind: kind.clone(),
            emitted: epoch_milli(),
        };

        let mut conn = self.storage.write_conn().await.with_context(|| {
            format!("could not publish event for kind '{kind}'; database error")
        })?;

        let kind_json = serde_json::to_string(&new_event.kind).with_context(|| {
            format!("could not publish event for kind '{kind}'; could not serialize event")
        })?;

        let id = storage::events::insert(
            &mut conn,
            &storage::events::Event {
                id: 0,
                kind: kind_json,
                emitted: new_event.emitted.to_string(),
            },
        )
        .await
        .with_context(|| format!("could not publish event for kind '{kind}'; database error"))?;

        new_event.id = id as u64;

        trace!(id = new_event.id, kind = %kind, emitted = new_event.emitted, "new event");

        if let Err(e) = self.broadcast_channel.send(new_event.clone()) {
            trace!(error = %e, "No receivers available to receive published event");
        }

        Ok(new_event)
    }

    /// Same as [`EventBus::try_publish`] but logs failures instead of returning them; most
    /// publish sites have nothing useful to do with a publish error.
    pub async fn publish(&self, kind: Kind) -> Option<Event> {
        match self.try_publish(kind).await {
            Ok(event) => Some(event),
            Err(e) => {
                error!(error = %e, "Could not publish event");
                None
            }
        }
    }
}

async fn prune_events(storage: &storage::Db, retention: u64) -> Result<(), storage::StorageError> {
    let mut offset = 0;
    let mut total_pruned = 0;

    let mut conn = storage.write_conn().await?;

    loop {
        let events = storage::events::list(&mut conn, offset, 50, false).await?;

        for event in &events {
            if is_past_cut_date(event, retention) {
                debug!(
                    emitted = event.emitted,
                    retention = retention,
                    current_time = epoch_milli(),
                    "removed event past retention period"
                );

                total_pruned += 1;

                storage::events::delete(&mut conn, event.id).await?;
            }
        }

        if events.len() != 50 {
            if total_pruned > 0 {
                info!(
                    retention = retention,
                    total_pruned = total_pruned,
                    "pruned old events"
                );
            }

            return Ok(());
        }

        offset += events.len() as i64;
    }
}

fn is_past_cut_date(event: &storage::events::Event, limit: u64) -> bool {
    let now = epoch_milli();
    let limit = Duration::from_secs(limit).as_millis() as u64;
    let expiry_time = now.saturating_sub(limit);

    let emitted = match event.emitted.parse::<u64>() {
        Ok(emitted) => emitted,
        Err(_) => return false,
    };

    emitted < expiry_time
}

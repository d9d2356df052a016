//! The trigger event loop: per-extension pollers long-poll each extension's watch endpoint and
//! fan trigger events into a single bounded channel; the central processor converts each event
//! into a pipeline run request.

use crate::engine::{
    event_utils, extensions, pipelines, run_utils, runs, Engine, EngineError, Variable,
    VariableSource,
};
use crate::storage;
use std::collections::{HashSet, VecDeque};
use std::sync::{atomic, Arc};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// How many recently seen event ids we remember per deduplication window. Extensions may
/// redeliver events across watch calls; anything inside the window is dropped silently.
const DEDUPE_WINDOW: usize = 1024;

/// Launches a run: reserves a new monotonic run id, persists the run, publishes the started-run
/// event and hands the run off to a shepherd which drives it to completion.
pub async fn launch_new_run(
    engine: Arc<Engine>,
    namespace_id: &str,
    pipeline_id: &str,
    initiator: runs::Initiator,
    variables: Vec<Variable>,
) -> Result<runs::Run, EngineError> {
    if engine
        .ignore_pipeline_run_events
        .load(atomic::Ordering::SeqCst)
    {
        debug!("Ignoring pipeline run request due to setting 'ignore_pipeline_run_events' being in state 'true'");
        return Err(EngineError::FailedPrecondition(
            "Pipeline run request ignored due to 'ignore_pipeline_run_events' being true".into(),
        ));
    }

    let pipeline = pipelines::get_live_pipeline(&engine, namespace_id, pipeline_id).await?;

    if pipeline.metadata.state != pipelines::PipelineState::Active {
        return Err(EngineError::FailedPrecondition(
            "Cannot start run due to pipeline being in an inactive state".into(),
        ));
    }

    let mut new_run = runs::Run::new(
        namespace_id,
        pipeline_id,
        pipeline.config.version,
        initiator,
        variables,
    );

    let new_run_storage: storage::runs::Run = new_run
        .clone()
        .try_into()
        .map_err(|e: anyhow::Error| EngineError::Unknown(e.to_string()))?;

    {
        let mut conn = engine.storage.write_conn().await.map_err(EngineError::from)?;

        let run_id = storage::runs::insert(&mut conn, &new_run_storage).await?;
        new_run.run_id = run_id as u64;
    }

    // We publish the started-run event up front and store its id on the run. A run missing its
    // matching completion event in the log is how recovery detects unfinished work after a crash.
    let started_event = engine
        .event_bus
        .publish(event_utils::Kind::StartedRun {
            namespace_id: namespace_id.to_string(),
            pipeline_id: pipeline_id.to_string(),
            run_id: new_run.run_id,
        })
        .await;

    if let Some(event) = started_event {
        new_run.event_id = Some(event.id);

        let mut conn = engine.storage.write_conn().await.map_err(EngineError::from)?;

        storage::runs::update(
            &mut conn,
            namespace_id,
            pipeline_id,
            new_run.run_id as i64,
            storage::runs::UpdatableFields {
                event_id: Some(event.id as i64),
                ..Default::default()
            },
        )
        .await?;
    }

    let shepherd = Arc::new(run_utils::Shepherd::new(
        engine.clone(),
        pipeline,
        new_run.clone(),
    ));

    tokio::spawn(shepherd.execute_task_tree());

    Ok(new_run)
}

/// Spins up the trigger event loop: one long-poll task per running extension plus the central
/// processor. All tasks wind down when the engine's root cancellation scope is cancelled.
pub async fn start_trigger_event_loop(engine: Arc<Engine>) {
    let event_rx = match engine.take_trigger_events_rx().await {
        Some(event_rx) => event_rx,
        None => {
            warn!("Trigger event loop was already started once for this process; ignoring");
            return;
        }
    };

    for extension in engine.extensions.iter() {
        tokio::spawn(watch_extension(
            engine.clone(),
            extension.key().clone(),
            engine.trigger_events.clone(),
        ));
    }

    tokio::spawn(process_extension_events(engine, event_rx));
}

/// Dedicated poller for a single extension. Long-polls the extension's watch endpoint and pushes
/// any returned events into the processor's channel.
pub async fn watch_extension(
    engine: Arc<Engine>,
    extension_id: String,
    events: mpsc::Sender<extensions::WatchEvent>,
) {
    info!(extension_id = extension_id, "Starting extension watcher");

    loop {
        if engine.shutdown.is_cancelled() {
            return;
        }

        let extension = match engine.extensions.get(&extension_id) {
            Some(extension) => extension.value().clone(),
            // The extension was uninstalled out from under us; the watcher dies with it.
            None => return,
        };

        let client = match extensions::ExtensionClient::new(
            &extension.url,
            &extension.secret,
            engine.config.extensions.verify_certs,
        ) {
            Ok(client) => client,
            Err(e) => {
                error!(extension_id = extension_id, error = %e, "Could not create extension client for watcher");
                return;
            }
        };

        let response = tokio::select! {
            _ = engine.shutdown.cancelled() => return,
            response = client.watch() => response,
        };

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                debug!(extension_id = extension_id, error = %e,
                    "Could not watch extension for events; retrying after backoff");
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
                continue;
            }
        };

        for mut event in response.events {
            event.extension_id = extension_id.clone();

            trace!(extension_id = extension_id, event_id = event.event_id, "Received trigger event");

            if events.send(event).await.is_err() {
                // Processor is gone; nothing left to do.
                return;
            }
        }
    }
}

/// The single consumer on the other end of the pollers. Deduplicates events and converts each
/// one into a run start, spawning a detached task per event so one slow run start never blocks
/// the stream.
async fn process_extension_events(
    engine: Arc<Engine>,
    mut events: mpsc::Receiver<extensions::WatchEvent>,
) {
    let mut seen_ids: HashSet<(String, String)> = HashSet::new();
    let mut seen_order: VecDeque<(String, String)> = VecDeque::new();

    loop {
        let event = tokio::select! {
            _ = engine.shutdown.cancelled() => return,
            event = events.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };

        let dedupe_key = (event.extension_id.clone(), event.event_id.clone());
        if !event.event_id.is_empty() {
            if seen_ids.contains(&dedupe_key) {
                trace!(event_id = event.event_id, "Dropping duplicate trigger event");
                continue;
            }

            seen_ids.insert(dedupe_key.clone());
            seen_order.push_back(dedupe_key);

            if seen_order.len() > DEDUPE_WINDOW {
                if let Some(oldest) = seen_order.pop_front() {
                    seen_ids.remove(&oldest);
                }
            }
        }

        tokio::spawn(process_single_event(engine.clone(), event));
    }
}

async fn process_single_event(engine: Arc<Engine>, event: extensions::WatchEvent) {
    // Subscription lookup happens before anything else; events that don't match a subscription
    // are logged and dropped.
    let subscription = {
        let mut conn = match engine.storage.read_conn().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "Could not establish connection to database while processing trigger event");
                return;
            }
        };

        match storage::extension_subscriptions::get(
            &mut conn,
            &event.namespace_id,
            &event.pipeline_id,
            &event.extension_id,
            &event.subscription_id,
        )
        .await
        {
            Ok(subscription) => subscription,
            Err(storage::StorageError::NotFound) => {
                debug!(
                    namespace_id = event.namespace_id,
                    pipeline_id = event.pipeline_id,
                    subscription_id = event.subscription_id,
                    "Dropping trigger event with no matching subscription"
                );
                return;
            }
            Err(e) => {
                error!(error = %e, "Could not look up subscription while processing trigger event");
                return;
            }
        }
    };

    // The trigger event itself is always recorded, even when no run will be launched for it.
    engine
        .event_bus
        .publish(event_utils::Kind::ReceivedExtensionEvent {
            extension_id: subscription.extension_id.clone(),
            namespace_id: event.namespace_id.clone(),
            pipeline_id: event.pipeline_id.clone(),
            subscription_id: event.subscription_id.clone(),
            result: event.result.to_string(),
        })
        .await;

    if event.result != extensions::WatchResult::Success {
        debug!(
            namespace_id = event.namespace_id,
            pipeline_id = event.pipeline_id,
            subscription_id = event.subscription_id,
            result = %event.result,
            "Trigger event did not request a run"
        );
        return;
    }

    let variables: Vec<Variable> = event
        .variables
        .iter()
        .map(|(key, value)| Variable {
            key: key.clone(),
            value: value.clone(),
            source: VariableSource::Extension,
        })
        .collect();

    let initiator = runs::Initiator {
        initiator_type: runs::InitiatorType::Extension,
        name: format!(
            "{}/{}",
            subscription.extension_id, subscription.subscription_id
        ),
        reason: event.details.clone(),
    };

    match launch_new_run(
        engine.clone(),
        &event.namespace_id,
        &event.pipeline_id,
        initiator,
        variables,
    )
    .await
    {
        Ok(run) => {
            info!(
                namespace_id = event.namespace_id,
                pipeline_id = event.pipeline_id,
                run_id = run.run_id,
                extension_id = subscription.extension_id,
                "Launched run for trigger event"
            );
        }
        Err(EngineError::FailedPrecondition(description)) => {
            // Covers both the global ignore switch and a missing live config; recorded but not
            // fatal to the loop.
            debug!(
                namespace_id = event.namespace_id,
                pipeline_id = event.pipeline_id,
                description = description,
                "Dropped trigger event"
            );
        }
        Err(e) => {
            error!(
                namespace_id = event.namespace_id,
                pipeline_id = event.pipeline_id,
                error = %e,
                "Could not launch run for trigger event"
            );

            engine
                .event_bus
                .publish(event_utils::Kind::FailedRunProcessing {
                    extension_id: subscription.extension_id.clone(),
                    namespace_id: event.namespace_id.clone(),
                    pipeline_id: event.pipeline_id.clone(),
                    description: e.to_string(),
                })
                .await;
        }
    }
}

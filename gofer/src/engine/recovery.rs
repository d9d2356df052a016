//! Restores correctness after an abrupt shutdown by reconciling runs whose started-run event has
//! no matching completed-run event in the event log, re-arming watchers for containers that kept
//! running through the restart.

use crate::engine::{
    event_utils, pipeline_configs, pipelines, run_utils, runs, task_executions, Engine,
};
use crate::storage;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};

/// What recovery decided to do with a single task execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// The task execution already reached a terminal state; register it so downstream
    /// dependency waits resolve.
    AlreadyComplete,

    /// The task execution never made it to the scheduler; launch it again with dependency
    /// re-checks running against the already known parents.
    Relaunch,

    /// The task execution claims to be running but was never handed to the scheduler; there is
    /// nothing to reattach to and nothing to relaunch safely.
    MarkOrphaned,

    /// The container may still be running on the scheduler; reattach the log tailer and exit
    /// watcher and let the scheduler's current status drive the transition.
    Reattach,
}

/// Classify a stored task execution into the action recovery should take for it.
pub fn classify_task_execution(task_execution: &task_executions::TaskExecution) -> RecoveryAction {
    match task_execution.state {
        task_executions::State::Complete => RecoveryAction::AlreadyComplete,
        task_executions::State::Unknown
        | task_executions::State::Processing
        | task_executions::State::Waiting => RecoveryAction::Relaunch,
        task_executions::State::Running => match task_execution.scheduler_id {
            Some(_) => RecoveryAction::Reattach,
            None => RecoveryAction::MarkOrphaned,
        },
    }
}

/// Streams the full event log in id order and returns the identity of every run whose
/// started-run event has no matching completed-run event.
pub async fn find_orphaned_runs(engine: &Engine) -> Result<Vec<(String, String, u64)>> {
    let mut conn = engine
        .storage
        .read_conn()
        .await
        .context("Could not establish connection to database while scanning for orphaned runs")?;

    let mut orphans: HashSet<(String, String, u64)> = HashSet::new();
    let mut offset = 0;

    loop {
        let events = storage::events::list(&mut conn, offset, 50, false)
            .await
            .context("Could not list events while scanning for orphaned runs")?;

        let event_count = events.len();

        for event_raw in events {
            let event: event_utils::Event = match event_raw.try_into() {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "Could not parse event while scanning for orphaned runs; skipping");
                    continue;
                }
            };

            match event.kind {
                event_utils::Kind::StartedRun {
                    namespace_id,
                    pipeline_id,
                    run_id,
                } => {
                    orphans.insert((namespace_id, pipeline_id, run_id));
                }
                event_utils::Kind::CompletedRun {
                    namespace_id,
                    pipeline_id,
                    run_id,
                    ..
                } => {
                    orphans.remove(&(namespace_id, pipeline_id, run_id));
                }
                _ => {}
            }
        }

        if event_count != 50 {
            break;
        }

        offset += event_count as i64;
    }

    let mut orphans: Vec<(String, String, u64)> = orphans.into_iter().collect();
    orphans.sort();

    Ok(orphans)
}

/// Attempt to recover runs which may have been left unfinished by a previous abrupt shutdown.
///
/// Safe to invoke repeatedly; every branch either leaves a terminal task execution alone or
/// re-arms a watcher for the same scheduler id.
pub async fn recover_runs(engine: Arc<Engine>) -> Result<()> {
    let orphaned_runs = find_orphaned_runs(&engine).await?;

    for (namespace_id, pipeline_id, run_id) in orphaned_runs {
        if let Err(e) = recover_run(engine.clone(), &namespace_id, &pipeline_id, run_id).await {
            error!(
                namespace_id = namespace_id,
                pipeline_id = pipeline_id,
                run_id = run_id,
                error = %e,
                "Could not recover unfinished run"
            );
        }
    }

    Ok(())
}

async fn recover_run(
    engine: Arc<Engine>,
    namespace_id: &str,
    pipeline_id: &str,
    run_id: u64,
) -> Result<()> {
    let mut conn = engine
        .storage
        .read_conn()
        .await
        .context("Could not establish connection to database while recovering run")?;

    let run_raw = storage::runs::get(&mut conn, namespace_id, pipeline_id, run_id as i64)
        .await
        .context("Could not load run while attempting to recover it")?;

    let run: runs::Run = run_raw
        .try_into()
        .context("Could not parse run while attempting to recover it")?;

    // The completion event can be lost to a crash that lands between the storage write and the
    // event publish; a run that storage says is finished needs no recovery.
    if run.state == runs::State::Complete {
        return Ok(());
    }

    info!(
        namespace_id = namespace_id,
        pipeline_id = pipeline_id,
        run_id = run_id,
        run_event_id = run.event_id,
        "Recovering unfinished run"
    );

    let metadata_raw = storage::pipeline_metadata::get(&mut conn, namespace_id, pipeline_id)
        .await
        .context("Could not load pipeline metadata while attempting to recover run")?;

    let metadata: pipelines::Metadata = metadata_raw
        .try_into()
        .context("Could not parse pipeline metadata while attempting to recover run")?;

    let config_raw = storage::pipeline_configs::get(
        &mut conn,
        namespace_id,
        pipeline_id,
        run.pipeline_config_version as i64,
    )
    .await
    .context("Could not load pipeline config while attempting to recover run")?;

    let tasks_raw = storage::tasks::list(
        &mut conn,
        namespace_id,
        pipeline_id,
        run.pipeline_config_version as i64,
    )
    .await
    .context("Could not load tasks while attempting to recover run")?;

    let config = pipeline_configs::Config::from_storage(config_raw, tasks_raw)
        .context("Could not parse pipeline config while attempting to recover run")?;

    let task_executions_raw =
        storage::task_executions::list(&mut conn, namespace_id, pipeline_id, run_id as i64)
            .await
            .context("Could not load task executions while attempting to recover run")?;

    drop(conn);

    let shepherd = Arc::new(run_utils::Shepherd::new(
        engine.clone(),
        pipelines::Pipeline { metadata, config },
        run,
    ));

    shepherd.launch_helper_tasks();

    let mut seen_task_ids = HashSet::new();

    for task_execution_raw in task_executions_raw {
        let task_execution: task_executions::TaskExecution = task_execution_raw
            .try_into()
            .context("Could not parse task execution while attempting to recover run")?;

        seen_task_ids.insert(task_execution.task_id.clone());

        match classify_task_execution(&task_execution) {
            RecoveryAction::AlreadyComplete => {
                shepherd.register_existing_task_execution(task_execution);
            }
            RecoveryAction::Relaunch => {
                tokio::spawn(
                    shepherd
                        .clone()
                        .launch_task_execution(task_execution.task.clone(), true),
                );
            }
            RecoveryAction::MarkOrphaned => {
                shepherd.register_existing_task_execution(task_execution.clone());
                shepherd
                    .set_task_execution_complete(
                        &task_execution.task_id,
                        None,
                        task_executions::Status::Unknown,
                        Some(task_executions::StatusReason {
                            reason: task_executions::StatusReasonType::Orphaned,
                            description: "missing scheduler id".into(),
                        }),
                    )
                    .await;
            }
            RecoveryAction::Reattach => {
                let container_id = task_executions::task_execution_container_id(
                    &task_execution.namespace_id,
                    &task_execution.pipeline_id,
                    task_execution.run_id,
                    &task_execution.task_id,
                );

                shepherd.register_existing_task_execution(task_execution.clone());

                tokio::spawn(
                    shepherd
                        .clone()
                        .monitor_task_execution(container_id, task_execution.task_id.clone()),
                );
            }
        }
    }

    // Tasks that never even got a task execution row need a fresh launch.
    for task in shepherd.pipeline.config.tasks.values() {
        if seen_task_ids.contains(&task.id) {
            continue;
        }

        tokio::spawn(shepherd.clone().launch_task_execution(task.clone(), true));
    }

    tokio::spawn(shepherd.wait_run_finish());

    Ok(())
}

//! The core run engine for Gofer; owns every long lived subsystem and the domain models they share.

pub mod event_handlers;
pub mod event_utils;
pub mod extensions;
pub mod external;
pub mod namespaces;
pub mod objects;
pub mod pipeline_configs;
pub mod pipelines;
pub mod recovery;
pub mod run_utils;
pub mod runs;
pub mod secrets;
pub mod subscriptions;
pub mod task_executions;
pub mod tasks;

#[cfg(test)]
pub mod tests;

use crate::{conf, object_store, scheduler, secret_store, storage};
use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use lazy_regex::regex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::{atomic, Arc};
use std::time::{SystemTime, UNIX_EPOCH};
use strum::{Display, EnumString};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// GOFEREOF is a special marker line we include at the end of log files.
/// It denotes that no further logs will be written. This provides the functionality for downstream
/// applications to follow log files without also having to monitor the container to know when
/// logs will no longer be printed.
pub const GOFER_EOF: &str = "GOFEREOF";

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("entity not found; {0}")]
    NotFound(String),

    #[error("entity already exists; {0}")]
    Exists(String),

    #[error("failed precondition; {0}")]
    FailedPrecondition(String),

    #[error("could not process run request; {0}")]
    RunProcessingError(String),

    #[error("storage error occurred")]
    Storage(#[source] storage::StorageError),

    #[error("scheduler error occurred")]
    Scheduler(#[source] scheduler::SchedulerError),

    #[error("secret store error occurred")]
    SecretStore(#[source] secret_store::SecretStoreError),

    #[error("object store error occurred")]
    ObjectStore(#[source] object_store::ObjectStoreError),

    #[error("unexpected error occurred; {0}")]
    Unknown(String),
}

impl From<storage::StorageError> for EngineError {
    fn from(value: storage::StorageError) -> Self {
        match value {
            storage::StorageError::NotFound => EngineError::NotFound("storage entity".into()),
            storage::StorageError::Exists => EngineError::Exists("storage entity".into()),
            _ => EngineError::Storage(value),
        }
    }
}

/// Holds every object that needs to exist for the entire runtime of the engine.
#[derive(Debug)]
pub struct Engine {
    /// The configuration read in at init.
    pub config: conf::api::ApiConfig,

    /// `Storage` represents the main backend storage implementation. Gofer stores most of its critical state
    /// information using this storage mechanism.
    pub storage: storage::Db,

    /// `Scheduler` is the mechanism in which Gofer runs its containers(tasks).
    pub scheduler: Box<dyn scheduler::Scheduler>,

    /// ObjectStore is the mechanism in which Gofer stores pipeline and run level objects. The implementation here
    /// is meant to act as a basic object store that Gofer's pipelines can use freely.
    pub object_store: Box<dyn object_store::ObjectStore>,

    /// SecretStore is the mechanism in which Gofer manages pipeline secrets.
    pub secret_store: Box<dyn secret_store::SecretStore>,

    /// Acts as an event bus for the entire application. It is used throughout the whole application to give
    /// different parts of the application the ability to listen for and respond to events that might happen in
    /// other parts.
    pub event_bus: event_utils::EventBus,

    /// An in-memory mapping of currently registered and started extensions. These extensions are registered on
    /// startup and launched as long running containers via the scheduler. Gofer refers to this cache as a way to
    /// communicate quickly with the containers and their potentially changing endpoints.
    pub extensions: DashMap<String, extensions::Extension>,

    /// Controls if pipelines are allowed to run globally. If this is set to true the entire service will
    /// not schedule new runs.
    pub ignore_pipeline_run_events: atomic::AtomicBool,

    /// The sending half of the trigger event channel. Every extension watcher pushes the events
    /// it collects into this channel; the processor on the other end turns them into runs.
    pub trigger_events: tokio::sync::mpsc::Sender<extensions::WatchEvent>,

    /// The receiving half of the trigger event channel, parked here until the trigger event loop
    /// claims it at startup.
    trigger_events_rx:
        tokio::sync::Mutex<Option<tokio::sync::mpsc::Receiver<extensions::WatchEvent>>>,

    /// The root cancellation scope for the whole process. Shutdown cancels this token which in turn winds
    /// down poll loops, watchers, and the web services.
    pub shutdown: CancellationToken,
}

/// How many trigger events may sit between the extension watchers and the processor before the
/// watchers start exerting backpressure on their extensions.
const TRIGGER_EVENT_CHANNEL_CAPACITY: usize = 100;

impl Engine {
    pub async fn new(config: conf::api::ApiConfig) -> Result<Arc<Self>> {
        let storage = storage::Db::new(&config.server.storage_path)
            .await
            .context("Could not initialize storage")?;
        let scheduler = scheduler::new(&config.scheduler)
            .await
            .context("Could not initialize scheduler")?;
        let object_store = object_store::new(&config.object_store)
            .await
            .context("Could not initialize object store")?;
        let secret_store = secret_store::new(&config.secret_store)
            .await
            .context("Could not initialize secret store")?;

        Self::from_parts(config, storage, scheduler, object_store, secret_store).await
    }

    /// Assemble an engine from already constructed subsystems. Mostly useful so tests can swap in
    /// their own scheduler or stores.
    pub async fn from_parts(
        config: conf::api::ApiConfig,
        storage: storage::Db,
        scheduler: Box<dyn scheduler::Scheduler>,
        object_store: Box<dyn object_store::ObjectStore>,
        secret_store: Box<dyn secret_store::SecretStore>,
    ) -> Result<Arc<Self>> {
        let event_bus = event_utils::EventBus::new(
            storage.clone(),
            config.api.event_log_retention,
            config.api.event_prune_interval,
        );

        let mut conn = storage
            .read_conn()
            .await
            .context("Could not establish connection to database during engine initialization")?;

        let system_parameters = storage::system::get_system_parameters(&mut conn)
            .await
            .context("Could not get system parameters during engine initialization")?;

        drop(conn);

        tokio::fs::create_dir_all(&config.api.task_execution_logs_dir)
            .await
            .context("Could not create task execution log directory")?;

        let (trigger_events, trigger_events_rx) =
            tokio::sync::mpsc::channel(TRIGGER_EVENT_CHANNEL_CAPACITY);

        let engine = Arc::new(Engine {
            config,
            storage,
            scheduler,
            object_store,
            secret_store,
            event_bus,
            extensions: DashMap::new(),
            ignore_pipeline_run_events: atomic::AtomicBool::new(
                system_parameters.ignore_pipeline_run_events,
            ),
            trigger_events,
            trigger_events_rx: tokio::sync::Mutex::new(Some(trigger_events_rx)),
            shutdown: CancellationToken::new(),
        });

        Ok(engine)
    }

    /// Hands the trigger event channel's receiving half to the trigger event loop. Can only be
    /// claimed once per process lifetime.
    pub(crate) async fn take_trigger_events_rx(
        &self,
    ) -> Option<tokio::sync::mpsc::Receiver<extensions::WatchEvent>> {
        self.trigger_events_rx.lock().await.take()
    }

    /// Performs all housekeeping needed to bring the engine fully online: the default namespace,
    /// run recovery, extension startup, subscription restoration, and the trigger event loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        namespaces::create_default_namespace(self)
            .await
            .context("Could not create default namespace")?;

        recovery::recover_runs(self.clone())
            .await
            .context("Could not recover unfinished runs")?;

        extensions::start_extensions(self.clone())
            .await
            .context("Could not start extensions")?;

        subscriptions::restore_extension_subscriptions(self)
            .await
            .context("Could not restore extension subscriptions")?;

        event_handlers::start_trigger_event_loop(self.clone()).await;

        if self.config.external_events.enable {
            let engine = self.clone();
            tokio::spawn(async move {
                if let Err(e) = external::start_web_service(engine).await {
                    tracing::error!(error = %e, "External events web service failed");
                }
            });
        }

        info!("Started Gofer engine");

        Ok(())
    }

    /// Gracefully wind the engine down: stop extensions then cancel all subtasks through the root
    /// cancellation scope.
    pub async fn stop(self: &Arc<Self>) {
        extensions::stop_extensions(self).await;
        self.shutdown.cancel();
    }

    /// Flips the global switch that controls whether trigger events are turned into pipeline runs.
    pub async fn toggle_event_ingress(&self, ignore: bool) -> Result<(), EngineError> {
        let mut conn = self.storage.write_conn().await.map_err(EngineError::from)?;

        storage::system::update_system_parameters(
            &mut conn,
            &storage::system::SystemParameters {
                ignore_pipeline_run_events: ignore,
            },
        )
        .await?;

        self.ignore_pipeline_run_events
            .store(ignore, atomic::Ordering::SeqCst);

        Ok(())
    }
}

/// Return the current epoch time in milliseconds.
pub fn epoch_milli() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

/// Identifiers are used as the primary key in most of Gofer's resources.
/// They're defined by the user and therefore should have some sane bounds.
/// For all ids we'll want the following:
/// * 32 > characters < 3
/// * Only alphanumeric characters or hyphens
///
/// We don't allow underscores to conform with common practices for url safe strings (this also
/// keeps user chosen identifiers from ever colliding with the reserved `global_secret` keyspace).
pub fn is_valid_identifier(id: &str) -> Result<()> {
    let alphanumeric_w_hyphen = regex!("^[a-zA-Z0-9-]*$");

    if id.len() > 32 {
        bail!("length cannot be greater than 32");
    }

    if id.len() < 3 {
        bail!("length cannot be less than 3");
    }

    if !alphanumeric_w_hyphen.is_match(id) {
        bail!("can only be made up of alphanumeric and hyphen characters");
    }

    Ok(())
}

#[derive(
    Debug, Clone, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum VariableSource {
    #[default]
    Unknown,

    /// From the user's own pipeline configuration.
    PipelineConfig,

    /// From the Gofer executor itself.
    System,

    /// Injected at the beginning of a particular run.
    RunOptions,

    /// Injected by a subscribed extension.
    Extension,
}

/// A variable is a key value pair that is used either at a run or task level.
/// The variable is inserted as an environment variable to an eventual task execution.
/// It can be owned by different parts of the system which control where the potentially
/// sensitive variables might show up.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Variable {
    pub key: String,
    pub value: String,
    pub source: VariableSource,
}

/// Gofer allows users to enter special interpolation strings such that
/// special functionality is substituted when Gofer reads these strings
/// in a user's pipeline configuration.
#[derive(Debug, Display, EnumString, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum InterpolationKind {
    Unknown,

    /// pipeline_secret{{\<key\>}}
    PipelineSecret,

    /// global_secret{{\<key\>}}
    GlobalSecret,

    /// run_object{{\<key\>}}
    RunObject,

    /// pipeline_object{{\<key\>}}
    PipelineObject,
}

/// Checks a string for the existence of an interpolation format. ex: "pipeline_secret{{ example }}".
/// If an interpolation was found we return Some, if not(the string was just a plain string) we return None.
///
/// Within the Some type is the kind of interpolation that was found and secondly the value found within.
///
/// Currently the supported interpolation syntaxes are:
///   - `pipeline_secret{{ example }}` for inserting from the pipeline secret store.
///   - `global_secret{{ example }}` for inserting from the global secret store.
///   - `pipeline_object{{ example }}` for inserting from the pipeline object store.
///   - `run_object{{ example }}` for inserting from the run object store.
pub fn parse_interpolation_syntax(raw_input: &str) -> Option<(InterpolationKind, String)> {
    let mut raw_input = raw_input.trim();

    let bracket_index = raw_input.find("{{")?;

    let interpolation_name_str = &raw_input[..bracket_index];
    let interpolation_kind = match InterpolationKind::from_str(interpolation_name_str) {
        Ok(kind) => kind,
        Err(_) => return None,
    };

    let interpolation_prefix = format!("{}{{{{", interpolation_kind.to_string().to_lowercase());
    let interpolation_suffix = "}}";
    if raw_input.starts_with(&interpolation_prefix) && raw_input.ends_with(interpolation_suffix) {
        raw_input = raw_input.strip_prefix(&interpolation_prefix).unwrap();
        raw_input = raw_input.strip_suffix(interpolation_suffix).unwrap();
        return Some((interpolation_kind, raw_input.trim().to_string()));
    }

    None
}

/// Gofer allows users to use secrets and objects from its built-in sources. To facilitate this the user
/// simply includes a special string into special places within the pipeline manifest(for now this is only
/// the "variables" field within a pipeline's tasks or a run). These special strings are decoded here.
///
/// Takes in a list of mixed plaintext and raw secret/store strings and returns it with
/// the fetched strings substituted for each type.
///
/// The 'run_id' is optional here since we use interpolate_vars in two separate contexts. The first context
/// is when we process a new run, in which case there might be some run specific vars that need to be interpolated.
/// The second is during pipeline subscriptions in which case you might want to pass a secret, but we aren't in the
/// context of a run and don't require it.
pub async fn interpolate_vars(
    engine: &Engine,
    namespace_id: &str,
    pipeline_id: &str,
    run_id: Option<u64>,
    variables: &Vec<Variable>,
) -> Result<Vec<Variable>> {
    let mut variable_list = vec![];

    for variable in variables {
        // If it's not an interpolated var we simply just add it to the vars and move on to the next one.
        let (interpolation_kind, value) = match parse_interpolation_syntax(&variable.value) {
            Some((kind, value)) => (kind, value),
            None => {
                variable_list.push(variable.to_owned());
                continue;
            }
        };

        match interpolation_kind {
            InterpolationKind::Unknown => {
                bail!(
                    "Parsed interpolation kind 'Unknown' for variable '{}'; this should never happen",
                    variable.key
                );
            }
            InterpolationKind::PipelineSecret => {
                let secret = secrets::get_pipeline_secret(engine, namespace_id, pipeline_id, &value)
                    .await
                    .map_err(|e| {
                        anyhow::anyhow!("Could not retrieve pipeline secret '{}'; {}", value, e)
                    })?;

                variable_list.push(Variable {
                    key: variable.key.clone(),
                    value: String::from_utf8_lossy(&secret).to_string(),
                    source: variable.source.clone(),
                });
            }
            InterpolationKind::GlobalSecret => {
                let secret = secrets::get_global_secret(engine, namespace_id, &value)
                    .await
                    .map_err(|e| {
                        anyhow::anyhow!("Could not retrieve global secret '{}'; {}", value, e)
                    })?;

                variable_list.push(Variable {
                    key: variable.key.clone(),
                    value: String::from_utf8_lossy(&secret).to_string(),
                    source: variable.source.clone(),
                });
            }
            InterpolationKind::PipelineObject => {
                let object = engine
                    .object_store
                    .get(&objects::pipeline_object_store_key(
                        namespace_id,
                        pipeline_id,
                        &value,
                    ))
                    .await
                    .map_err(|e| {
                        anyhow::anyhow!("Could not retrieve pipeline object '{}'; {}", value, e)
                    })?;

                variable_list.push(Variable {
                    key: variable.key.clone(),
                    value: String::from_utf8_lossy(&object).to_string(),
                    source: variable.source.clone(),
                });
            }
            InterpolationKind::RunObject => {
                let run_id = match run_id {
                    Some(run_id) => run_id,
                    None => continue,
                };

                let object = engine
                    .object_store
                    .get(&objects::run_object_store_key(
                        namespace_id,
                        pipeline_id,
                        run_id,
                        &value,
                    ))
                    .await
                    .map_err(|e| {
                        anyhow::anyhow!("Could not retrieve run object '{}'; {}", value, e)
                    })?;

                variable_list.push(Variable {
                    key: variable.key.clone(),
                    value: String::from_utf8_lossy(&object).to_string(),
                    source: variable.source.clone(),
                });
            }
        };
    }

    Ok(variable_list)
}

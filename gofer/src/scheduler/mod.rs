pub mod docker;

use crate::conf;
use async_trait::async_trait;
use futures::Stream;
use serde::Deserialize;
use std::fmt::Debug;
use std::{collections::HashMap, pin::Pin};
use strum::{Display, EnumString};
use tokio::io::AsyncWrite;

/// Represents different scheduler failure possibilities.
#[derive(thiserror::Error, Debug)]
pub enum SchedulerError {
    /// Failed to start scheduler due to misconfigured settings, usually from a misconfigured settings file.
    #[error("could not init scheduler; {0}")]
    FailedSchedulerPrecondition(String),

    /// Failed to communicate with the scheduler due to a network error or the like. These errors are
    /// considered transient; operations that hit them may be retried.
    #[error("could not connect to scheduler; {0}")]
    Connection(String),

    /// Container requested by id could not be found.
    #[error("container not found; {0}")]
    NoSuchContainer(String),

    /// Image requested by name could not be found.
    #[error("docker image not found; {0}")]
    NoSuchImage(String),

    /// An unexpected and unknown error has occurred.
    #[error("unexpected scheduler error occurred; {0}")]
    Unknown(String),
}

impl SchedulerError {
    /// Transient errors are worth retrying against a task's retry budget; everything else is final.
    pub fn is_transient(&self) -> bool {
        matches!(self, SchedulerError::Connection(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ContainerState {
    Unknown,
    Running,
    Paused,
    Restarting,
    Exited,
}

/// Private repositories sometimes require authentication.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    pub user: String,
    pub pass: String,
}

#[derive(Debug)]
pub struct StartContainerRequest {
    /// A unique identifier to identify the container with.
    pub id: String,

    /// The docker image repository and docker image name; tag can be included.
    pub image: String,

    /// Environment variables to be passed to the container.
    pub variables: HashMap<String, String>,

    /// Registry authentication details.
    pub registry_auth: Option<RegistryAuth>,

    /// Attempt to pull the container from the upstream repository even if it exists already locally.
    /// This is useful if your containers don't use proper tagging or versioning.
    pub always_pull: bool,

    /// Only needed by extension containers; spin the container up with the given port exposed so that
    /// Gofer can connect to it.
    pub networking: Option<u16>,

    /// Replaces the container's entrypoint with a custom one.
    pub entrypoint: Option<Vec<String>>,

    /// Replaces the container's cmd instruction with a custom one.
    pub command: Option<Vec<String>>,
}

#[derive(Debug)]
pub struct StartContainerResponse {
    /// An optional, unique way for the scheduler to identify the container. Sometimes the scheduler
    /// will not be able to use the client provided container id as a unique identifier and will
    /// return its own identifier. In these cases the client will have to store the scheduler's id
    /// for further use.
    pub scheduler_id: Option<String>,

    /// An endpoint that is only returned for containers started with networking turned on.
    pub url: Option<String>,
}

#[derive(Debug)]
pub struct StopContainerRequest {
    /// A unique identifier to identify the container with.
    pub id: String,

    /// The total time in seconds the scheduler should wait for a graceful stop before issuing a SIGKILL.
    /// A timeout of 0 kills the container immediately.
    pub timeout: i64,
}

#[derive(Debug)]
pub struct GetStateRequest {
    /// Unique identifier for the container.
    pub id: String,
}

#[derive(Debug)]
pub struct GetStateResponse {
    /// In the event that the container is in a "complete" state; the exit code of that container.
    pub exit_code: Option<u8>,

    /// The current state of the container, state referencing how complete the container process of running is.
    pub state: ContainerState,
}

#[derive(Debug)]
pub struct GetLogsRequest {
    /// Unique identifier for the container.
    pub id: String,
}

#[derive(Debug)]
pub struct AttachContainerRequest {
    /// Unique identifier for the container.
    pub id: String,

    /// The command to run inside the container.
    pub command: Vec<String>,
}

pub struct AttachContainerResponse {
    /// Input stream into the attached process.
    pub input: Pin<Box<dyn AsyncWrite + Send>>,

    /// Output stream from the attached process.
    pub output: Pin<Box<dyn Stream<Item = Result<Log, SchedulerError>> + Send>>,
}

/// Represents a single log line/entry from a particular container.
#[derive(Debug)]
pub enum Log {
    Unknown,
    Stdout(bytes::Bytes),
    Stderr(bytes::Bytes),
}

/// The scheduler trait defines what the interface between Gofer and a container scheduler should look like.
#[async_trait]
pub trait Scheduler: Debug + Send + Sync {
    /// Start a container based on details passed; Should implement automatically pulling and registry auth
    /// of the container if necessary.
    async fn start_container(
        &self,
        req: StartContainerRequest,
    ) -> Result<StartContainerResponse, SchedulerError>;

    /// Kill a container with an associated timeout if the container does not respond to graceful shutdown.
    async fn stop_container(&self, req: StopContainerRequest) -> Result<(), SchedulerError>;

    /// Get the current state of the container and potential exit code.
    async fn get_state(&self, req: GetStateRequest) -> Result<GetStateResponse, SchedulerError>;

    /// Returns a stream of logs from the container.
    fn get_logs(
        &self,
        req: GetLogsRequest,
    ) -> Pin<Box<dyn Stream<Item = Result<Log, SchedulerError>> + Send>>;

    /// Run a command inside an already running container and attach to its input and output.
    async fn attach_container(
        &self,
        req: AttachContainerRequest,
    ) -> Result<AttachContainerResponse, SchedulerError>;
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Display, EnumString)]
pub enum Engine {
    Docker,
}

impl Default for Engine {
    fn default() -> Self {
        Engine::Docker
    }
}

pub async fn new(config: &conf::api::Scheduler) -> Result<Box<dyn Scheduler>, SchedulerError> {
    #[allow(clippy::match_single_binding)]
    match config.engine {
        Engine::Docker => {
            if let Some(config) = &config.docker {
                let engine = docker::Docker::new(config.prune, config.prune_interval).await?;
                Ok(Box::new(engine))
            } else {
                Err(SchedulerError::FailedSchedulerPrecondition(
                    "docker engine settings not found in config".into(),
                ))
            }
        }
    }
}

use super::*;
use async_trait::async_trait;
use futures::stream::TryStreamExt;
use futures::Stream;
use serde::Deserialize;
use std::pin::Pin;
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, error};

fn format_env_var(key: &str, value: &str) -> String {
    format!("{}={}", key, value)
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Config {
    /// Periodically remove containers that are no longer in use.
    pub prune: bool,

    /// How often to perform the prune, in seconds.
    pub prune_interval: u64,
}

#[derive(Debug)]
pub struct Docker {
    client: Arc<bollard::Docker>,
}

impl Docker {
    pub async fn new(prune: bool, prune_interval: u64) -> Result<Self, SchedulerError> {
        let client = bollard::Docker::connect_with_socket_defaults().map_err(|e| {
            SchedulerError::Connection(format!(
                "{}; Make sure the Docker daemon is installed and running.",
                e
            ))
        })?;
        let client = Arc::new(client);
        let prune_client = Arc::clone(&client);

        // Check that we can actually get a connection.
        let version = client.version().await.map_err(|e| {
            SchedulerError::Connection(format!(
                "{}; Make sure the Docker daemon is installed and running.",
                e
            ))
        })?;

        // We periodically need to clean up docker assets so we don't run out of disk space.
        // We perform it very infrequently though, in order to give operators time to diagnose
        // any potential issues they might be having with a particular container.
        if prune {
            tokio::spawn(async move {
                loop {
                    match prune_client.prune_containers::<String>(None).await {
                        Ok(response) => {
                            debug!(
                                containers_deleted = ?response.containers_deleted,
                                space_reclaimed = response.space_reclaimed,
                                "Pruned containers"
                            );
                        }
                        Err(e) => {
                            error!(error = %e, "could not successfully prune containers");
                        }
                    };

                    tokio::time::sleep(std::time::Duration::from_secs(prune_interval)).await;
                }
            });

            debug!(interval = prune_interval, "Started docker pruning");
        }

        debug!(
            version = version.version.unwrap_or_default(),
            "Local docker scheduler successfully connected"
        );

        Ok(Self { client })
    }
}

#[async_trait]
impl Scheduler for Docker {
    async fn start_container(
        &self,
        req: StartContainerRequest,
    ) -> Result<StartContainerResponse, SchedulerError> {
        let credentials = req
            .registry_auth
            .as_ref()
            .map(|ra| bollard::auth::DockerCredentials {
                username: Some(ra.user.clone()),
                password: Some(ra.pass.clone()),
                ..Default::default()
            });

        if req.always_pull {
            self.client
                .create_image(
                    Some(bollard::image::CreateImageOptions {
                        from_image: req.image.clone(),
                        ..Default::default()
                    }),
                    None,
                    credentials,
                )
                .try_collect::<Vec<_>>()
                .await
                .map_err(|e| SchedulerError::NoSuchImage(e.to_string()))?;
        } else {
            let mut filters = HashMap::new();
            filters.insert("reference".to_string(), vec![req.image.clone()]);

            let images = self
                .client
                .list_images(Some(bollard::image::ListImagesOptions {
                    all: true,
                    filters,
                    ..Default::default()
                }))
                .await
                .map_err(|e| SchedulerError::Connection(e.to_string()))?;

            if images.is_empty() {
                self.client
                    .create_image(
                        Some(bollard::image::CreateImageOptions {
                            from_image: req.image.clone(),
                            ..Default::default()
                        }),
                        None,
                        credentials,
                    )
                    .try_collect::<Vec<_>>()
                    .await
                    .map_err(|e| SchedulerError::NoSuchImage(e.to_string()))?;
            }
        }

        if let Err(e) = self
            .client
            .remove_container(
                &req.id,
                Some(bollard::container::RemoveContainerOptions {
                    v: true,
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            debug!(id = &req.id, error = %e, "could not remove previous container");
        }

        let mut container_config = bollard::container::Config {
            image: Some(req.image.clone()),
            env: Some(
                req.variables
                    .into_iter()
                    .map(|(key, value)| format_env_var(&key, &value))
                    .collect(),
            ),
            ..Default::default()
        };

        if let Some(entrypoint) = req.entrypoint {
            container_config.entrypoint = Some(entrypoint);
        }

        if let Some(command) = req.command {
            container_config.cmd = Some(command);
        }

        // In order to properly set up a container such that we can talk to it we need several things:
        // 1) We need to expose the port that the container is listening on.
        // 2) We then need to bind one of our local/host ports to the port of the local machine. This enables
        //    us to direct traffic to the port. We set this to 127.0.0.1 to keep it purely local
        //    and then we omit the port so that the docker engine assigns us a random open port.
        // 3) Finally we create a binding in docker between the addresses in step 1 and 2.
        let container_port = req.networking.map(|port| format!("{port}/tcp"));

        if let Some(container_port) = &container_port {
            let mut exposed_ports = HashMap::new();
            exposed_ports.insert(container_port.clone(), HashMap::new());
            container_config.exposed_ports = Some(exposed_ports);

            let host_port_binding = bollard::models::PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                // a value of None for host_port conveys that the engine should automatically allocate a port from
                // the freely available ephemeral port range (32768-61000)
                host_port: None,
            };
            let mut port_bindings = HashMap::new();
            port_bindings.insert(container_port.clone(), Some(vec![host_port_binding]));

            container_config.host_config = Some(bollard::models::HostConfig {
                port_bindings: Some(port_bindings),
                ..Default::default()
            })
        }

        let created_container = self
            .client
            .create_container(
                Some(bollard::container::CreateContainerOptions {
                    name: &req.id,
                    platform: None,
                }),
                container_config,
            )
            .await
            .map_err(|e| SchedulerError::Unknown(e.to_string()))?;

        self.client
            .start_container::<String>(&req.id, None)
            .await
            .map_err(|e| SchedulerError::Unknown(e.to_string()))?;

        let mut response = StartContainerResponse {
            scheduler_id: Some(created_container.id),
            url: None,
        };

        if let Some(container_port) = container_port {
            let container_info = self
                .client
                .inspect_container(&req.id, None)
                .await
                .map_err(|e| SchedulerError::Unknown(e.to_string()))?;

            let port = container_info
                .network_settings
                .and_then(|settings| settings.ports)
                .and_then(|mut ports| ports.remove(&container_port).flatten())
                .and_then(|bindings| bindings.into_iter().next())
                .ok_or_else(|| {
                    SchedulerError::Unknown("could not get networking settings".to_string())
                })?;

            response.url = Some(format!(
                "{}:{}",
                port.host_ip.unwrap_or_else(|| "127.0.0.1".to_string()),
                port.host_port.unwrap_or_default()
            ));
        }

        Ok(response)
    }

    async fn stop_container(&self, req: StopContainerRequest) -> Result<(), SchedulerError> {
        self.client
            .stop_container(
                &req.id,
                Some(bollard::container::StopContainerOptions { t: req.timeout }),
            )
            .await
            .map_err(|e| SchedulerError::NoSuchContainer(e.to_string()))?;

        Ok(())
    }

    async fn get_state(&self, req: GetStateRequest) -> Result<GetStateResponse, SchedulerError> {
        let container_info = self
            .client
            .inspect_container(&req.id, None)
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                } => SchedulerError::NoSuchContainer(e.to_string()),
                _ => SchedulerError::Connection(e.to_string()),
            })?;

        let state = container_info
            .state
            .ok_or_else(|| SchedulerError::Unknown("container state missing".to_string()))?;

        match state.status {
            Some(bollard::models::ContainerStateStatusEnum::CREATED)
            | Some(bollard::models::ContainerStateStatusEnum::RUNNING) => Ok(GetStateResponse {
                exit_code: None,
                state: ContainerState::Running,
            }),
            Some(bollard::models::ContainerStateStatusEnum::PAUSED) => Ok(GetStateResponse {
                exit_code: None,
                state: ContainerState::Paused,
            }),
            Some(bollard::models::ContainerStateStatusEnum::RESTARTING) => Ok(GetStateResponse {
                exit_code: None,
                state: ContainerState::Restarting,
            }),
            Some(bollard::models::ContainerStateStatusEnum::EXITED)
            | Some(bollard::models::ContainerStateStatusEnum::DEAD) => Ok(GetStateResponse {
                exit_code: state.exit_code.map(|code| code as u8),
                state: ContainerState::Exited,
            }),
            _ => Ok(GetStateResponse {
                exit_code: None,
                state: ContainerState::Unknown,
            }),
        }
    }

    fn get_logs(
        &self,
        req: GetLogsRequest,
    ) -> Pin<Box<dyn Stream<Item = Result<Log, SchedulerError>> + Send>> {
        let logs_options = bollard::container::LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let logs = self.client.logs(&req.id, Some(logs_options));

        let logs = logs
            .map_ok(|log| match log {
                bollard::container::LogOutput::StdOut { message } => Log::Stdout(message),
                bollard::container::LogOutput::StdErr { message } => Log::Stderr(message),
                _ => Log::Unknown,
            })
            .map_err(|e| SchedulerError::NoSuchContainer(e.to_string()));

        Box::pin(logs)
    }

    async fn attach_container(
        &self,
        req: AttachContainerRequest,
    ) -> Result<AttachContainerResponse, SchedulerError> {
        let exec = self
            .client
            .create_exec(
                &req.id,
                bollard::exec::CreateExecOptions {
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(req.command),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SchedulerError::NoSuchContainer(e.to_string()))?;

        let attached = self
            .client
            .start_exec(
                &exec.id,
                Some(bollard::exec::StartExecOptions {
                    detach: false,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| SchedulerError::Unknown(e.to_string()))?;

        match attached {
            bollard::exec::StartExecResults::Attached { output, input } => {
                let output = output
                    .map_ok(|log| match log {
                        bollard::container::LogOutput::StdOut { message } => Log::Stdout(message),
                        bollard::container::LogOutput::StdErr { message } => Log::Stderr(message),
                        _ => Log::Unknown,
                    })
                    .map_err(|e| SchedulerError::Unknown(e.to_string()));

                Ok(AttachContainerResponse {
                    input,
                    output: Box::pin(output),
                })
            }
            bollard::exec::StartExecResults::Detached => Err(SchedulerError::Unknown(
                "exec unexpectedly started detached".to_string(),
            )),
        }
    }
}

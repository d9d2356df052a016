use crate::engine::{
    epoch_milli, event_utils, is_valid_identifier, Engine, EngineError, Variable, VariableSource,
};
use crate::{scheduler, storage};
use anyhow::{anyhow, bail, Context, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use strum::{Display, EnumString};
use tracing::{debug, error, info};

/// The address Gofer tells an extension to bind to on startup.
const EXTENSION_BIND_ADDRESS: &str = "0.0.0.0:8082";

/// The container port extensions listen on; published to an ephemeral host port by the scheduler.
const EXTENSION_PORT: u16 = 8082;

/// How many times we probe a starting extension before giving up on it.
const EXTENSION_STARTUP_ATTEMPTS: u64 = 30;

pub fn extension_container_id(extension_id: &str) -> String {
    format!("extension_{extension_id}")
}

#[derive(
    Debug, Clone, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum State {
    /// Should never be in this state.
    #[default]
    Unknown,

    /// Pre-scheduling validation and prep.
    Processing,

    /// Currently running as reported by the scheduler.
    Running,

    /// Extension has exited; usually because of an error.
    Exited,
}

#[derive(
    Debug, Clone, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum Status {
    /// Cannot determine status of Extension; should never be in this status.
    #[default]
    Unknown,

    /// Installed and able to be used by pipelines.
    Enabled,

    /// Not available to be used by pipelines, either through lack of installation or being
    /// disabled by an admin.
    Disabled,
}

/// When installing a new extension, the installer passes a set of details that allow Gofer to
/// relaunch that extension on future startups.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Registration {
    /// Unique identifier for the extension.
    pub extension_id: String,

    /// Which container image this extension should run.
    pub image: String,

    /// Auth credentials for the image's registry.
    pub registry_auth: Option<super::tasks::RegistryAuth>,

    /// Extensions allow configuration through env vars passed to them at startup. Refer to the
    /// extension's documentation for setting values.
    pub settings: Vec<Variable>,

    /// Time of registration creation in epoch milliseconds.
    pub created: u64,

    /// Time of last modification in epoch milliseconds.
    pub modified: u64,

    /// Whether the extension is enabled or not; extensions can be disabled to prevent use by
    /// admins, and are disabled automatically when they fail to start.
    pub status: Status,
}

impl TryFrom<storage::extension_registrations::ExtensionRegistration> for Registration {
    type Error = anyhow::Error;

    fn try_from(value: storage::extension_registrations::ExtensionRegistration) -> Result<Self> {
        let created = value.created.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'created' from storage value '{}'",
                value.created
            )
        })?;

        let modified = value.modified.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'modified' from storage value '{}'",
                value.modified
            )
        })?;

        let status = Status::from_str(&value.status).with_context(|| {
            format!(
                "Could not parse field 'status' from storage value '{}'",
                value.status
            )
        })?;

        let registry_auth = if value.registry_auth.is_empty() {
            None
        } else {
            Some(serde_json::from_str(&value.registry_auth).with_context(|| {
                format!(
                    "Could not parse field 'registry_auth' from storage value '{}'",
                    value.registry_auth
                )
            })?)
        };

        let settings = serde_json::from_str(&value.settings).with_context(|| {
            format!(
                "Could not parse field 'settings' from storage value '{}'",
                value.settings
            )
        })?;

        Ok(Registration {
            extension_id: value.extension_id,
            image: value.image,
            registry_auth,
            settings,
            created,
            modified,
            status,
        })
    }
}

impl TryFrom<Registration> for storage::extension_registrations::ExtensionRegistration {
    type Error = anyhow::Error;

    fn try_from(value: Registration) -> Result<Self> {
        let registry_auth = match &value.registry_auth {
            Some(auth) => serde_json::to_string(auth)
                .context("Could not serialize field 'registry_auth' to storage value")?,
            None => String::new(),
        };

        let settings = serde_json::to_string(&value.settings)
            .context("Could not serialize field 'settings' to storage value")?;

        Ok(Self {
            extension_id: value.extension_id,
            image: value.image,
            registry_auth,
            settings,
            created: value.created.to_string(),
            modified: value.modified.to_string(),
            status: value.status.to_string(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub key: String,
    pub required: bool,
    pub documentation: String,
}

/// Extension provided documentation; collected once at startup from the extension's info
/// endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Documentation {
    /// Each extension has configuration parameters that can be passed in at extension startup.
    /// These parameters should control extension behavior for its entire lifetime.
    pub config_params: Vec<Parameter>,

    /// Each extension has pipeline subscription parameters that are passed in by a pipeline when
    /// it attempts to subscribe to an extension. This controls how the extension treats that
    /// specific pipeline subscription.
    pub pipeline_subscription_params: Vec<Parameter>,

    /// Anything the extension wants to explain to the user. This text is inserted into the
    /// documentation a user can look up about the extension.
    pub body: String,
}

/// An extension is the way that pipelines add extra functionality to themselves. Pipelines can
/// "subscribe" to extensions and extensions then act on behalf of that pipeline. This is the
/// runtime record for an extension that has been started; it is an in-memory cache entry keyed
/// by the extension's id.
#[derive(Debug, Clone)]
pub struct Extension {
    /// Metadata about the extension as it is registered within Gofer.
    pub registration: Registration,

    /// The network address used to communicate with the extension by the main process.
    pub url: String,

    /// The start time of the extension in epoch milliseconds.
    pub started: u64,

    /// The current state of the extension as it exists within Gofer's operating model.
    pub state: State,

    /// Extension given documentation.
    pub documentation: Documentation,

    /// The extension's authentication key, rotated on every start. Gofer passes this key on
    /// every request to the extension so that it is impossible for others to contact and
    /// manipulate extensions directly.
    pub secret: String,
}

/// Info returned by an extension's info endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InfoResponse {
    pub extension_id: String,
    pub documentation: Documentation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub namespace_id: String,
    pub pipeline_id: String,
    pub subscription_id: String,
    pub settings: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsubscribeRequest {
    pub namespace_id: String,
    pub pipeline_id: String,
    pub subscription_id: String,
}

#[derive(
    Debug, Clone, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum WatchResult {
    #[default]
    Unknown,

    /// The extension determined the pipeline should run.
    Success,

    /// The extension evaluated the trigger but decided against a run; recorded for posterity.
    Failure,
}

/// A single trigger event returned by an extension's watch endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEvent {
    /// Which extension emitted the event. Stamped by the watcher that received it, never trusted
    /// from the wire.
    #[serde(default, skip_deserializing)]
    pub extension_id: String,

    /// Extension assigned identifier for the event; used to deduplicate redelivered events.
    pub event_id: String,

    /// Which pipeline subscription this event belongs to.
    pub namespace_id: String,
    pub pipeline_id: String,
    pub subscription_id: String,

    pub result: WatchResult,

    /// Freeform detail about why the event fired.
    pub details: String,

    /// Variables the extension wants injected into the resulting run.
    pub variables: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchResponse {
    /// Events that fired since the last watch call; empty when the long-poll timed out without
    /// any events.
    pub events: Vec<WatchEvent>,
}

/// A thin HTTP client for the endpoints every extension container serves. The Gofer core
/// authenticates to extensions via a bearer token generated at extension start.
#[derive(Debug, Clone)]
pub struct ExtensionClient {
    client: reqwest::Client,
    base_url: String,
}

impl ExtensionClient {
    pub fn new(url: &str, secret: &str, verify_certs: bool) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();

        let mut auth_value =
            reqwest::header::HeaderValue::from_str(&format!("Bearer {secret}"))
                .context("Could not construct authorization header for extension client")?;
        auth_value.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth_value);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .danger_accept_invalid_certs(!verify_certs)
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Could not build extension client")?;

        Ok(ExtensionClient {
            client,
            base_url: url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn health(&self) -> Result<()> {
        self.client
            .get(format!("{}/api/health", self.base_url))
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }

    pub async fn info(&self) -> Result<InfoResponse> {
        let response = self
            .client
            .get(format!("{}/api/info", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json::<InfoResponse>()
            .await?;

        Ok(response)
    }

    pub async fn subscribe(&self, request: &SubscribeRequest) -> Result<()> {
        self.client
            .post(format!("{}/api/subscribe", self.base_url))
            .json(request)
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }

    pub async fn unsubscribe(&self, request: &UnsubscribeRequest) -> Result<()> {
        self.client
            .delete(format!("{}/api/subscribe", self.base_url))
            .json(request)
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }

    /// Long-polls the extension for trigger events. The extension holds the request open until
    /// it has events to deliver or its internal hold time elapses; our deadline sits above that
    /// hold time.
    pub async fn watch(&self) -> Result<WatchResponse> {
        let response = self
            .client
            .get(format!("{}/api/watch", self.base_url))
            .timeout(std::time::Duration::from_secs(120))
            .send()
            .await?
            .error_for_status()?
            .json::<WatchResponse>()
            .await?;

        Ok(response)
    }

    pub async fn external_event(&self, payload: Vec<u8>) -> Result<()> {
        self.client
            .post(format!("{}/api/external-event", self.base_url))
            .body(payload)
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.client
            .post(format!("{}/api/shutdown", self.base_url))
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }
}

/// Generates the rotating pre-shared key an extension uses to authenticate requests from the
/// main process.
fn generate_extension_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

/// Loads the TLS cert/key pair handed to extensions so they can serve TLS. Returns empty values
/// when extension TLS is turned off.
fn load_extension_tls(engine: &Engine) -> Result<(Vec<u8>, Vec<u8>)> {
    if !engine.config.extensions.use_tls {
        return Ok((vec![], vec![]));
    }

    let cert_path = engine
        .config
        .extensions
        .tls_cert_path
        .as_ref()
        .ok_or_else(|| anyhow!("extensions.tls_cert_path is required when extensions.use_tls is on"))?;

    let key_path = engine
        .config
        .extensions
        .tls_key_path
        .as_ref()
        .ok_or_else(|| anyhow!("extensions.tls_key_path is required when extensions.use_tls is on"))?;

    let cert = std::fs::read(cert_path)
        .context("Error occurred while attempting to read TLS cert file from path")?;
    let key = std::fs::read(key_path)
        .context("Error occurred while attempting to read TLS key file from path")?;

    Ok((cert, key))
}

/// Attempts to start a single extension container via the scheduler. The function itself
/// attempts to do everything needed so that the resulting extension is ready for use:
///
/// 1) Generate a fresh extension key.
/// 2) Pass in the config env vars and the Gofer system provided env vars.
/// 3) Start the container and wait for the scheduler to report it running.
/// 4) Probe the advertised URL until the extension reports ready.
/// 5) Collect the extension's info/documentation and cache the runtime record.
pub async fn start_extension(
    engine: &Arc<Engine>,
    registration: Registration,
) -> Result<Extension> {
    let extension_key = generate_extension_key();

    let (tls_cert, tls_key) =
        load_extension_tls(engine).context("Could not load extension TLS keys")?;

    // Populate the extension with its required environment variables; these are passed to every
    // extension regardless of configuration.
    let system_extension_vars: Vec<Variable> = vec![
        Variable {
            key: "GOFER_EXTENSION_SYSTEM_TLS_CERT".into(),
            value: String::from_utf8_lossy(&tls_cert).to_string(),
            source: VariableSource::System,
        },
        Variable {
            key: "GOFER_EXTENSION_SYSTEM_TLS_KEY".into(),
            value: String::from_utf8_lossy(&tls_key).to_string(),
            source: VariableSource::System,
        },
        // The extension id is a human readable name for the extension that also acts as the
        // extension's unique ID among all other extensions.
        Variable {
            key: "GOFER_EXTENSION_SYSTEM_ID".into(),
            value: registration.extension_id.clone(),
            source: VariableSource::System,
        },
        Variable {
            key: "GOFER_EXTENSION_SYSTEM_LOG_LEVEL".into(),
            value: engine.config.api.log_level.clone(),
            source: VariableSource::System,
        },
        // The system secret is generated for the sole purpose of authentication between Gofer
        // and the extension. It serves as a pre-shared auth key that is verified on both sides
        // when either side makes a request.
        Variable {
            key: "GOFER_EXTENSION_SYSTEM_SECRET".into(),
            value: extension_key.clone(),
            source: VariableSource::System,
        },
        // The Gofer host is the url where extensions can contact the Gofer server, in case the
        // extension needs to execute any API calls.
        Variable {
            key: "GOFER_EXTENSION_SYSTEM_GOFER_HOST".into(),
            value: engine.config.server.extension_address.clone(),
            source: VariableSource::System,
        },
        Variable {
            key: "GOFER_EXTENSION_SYSTEM_BIND_ADDRESS".into(),
            value: EXTENSION_BIND_ADDRESS.to_string(),
            source: VariableSource::System,
        },
    ];

    // Now that we've defined the system vars that are included on every extension launch we
    // chain on the env vars from the extension registration.
    let extension_vars: Vec<Variable> = system_extension_vars
        .iter()
        .chain(registration.settings.iter())
        .cloned()
        .collect();

    debug!(id = registration.extension_id, "Starting extension");

    let container_id = extension_container_id(&registration.extension_id);

    let start_response = engine
        .scheduler
        .start_container(scheduler::StartContainerRequest {
            id: container_id.clone(),
            image: registration.image.clone(),
            variables: extension_vars
                .into_iter()
                .map(|var| (var.key, var.value))
                .collect(),
            registry_auth: registration
                .registry_auth
                .clone()
                .map(|auth| auth.into()),
            always_pull: false,
            networking: Some(EXTENSION_PORT),
            entrypoint: None,
            command: None,
        })
        .await
        .map_err(|e| anyhow!("Could not launch extension container; {:#?}", e))?;

    // Wait for the scheduler to say that the container is running.
    let mut attempts = 0;
    loop {
        if attempts >= EXTENSION_STARTUP_ATTEMPTS {
            bail!(
                "Timed out while waiting for extension container '{}' to start",
                container_id
            );
        }

        tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;

        let container_state = engine
            .scheduler
            .get_state(scheduler::GetStateRequest {
                id: container_id.clone(),
            })
            .await
            .map_err(|e| {
                anyhow!(
                    "Could not verify container '{}' due to error with scheduler; {:#?}",
                    container_id,
                    e
                )
            })?;

        match container_state.state {
            scheduler::ContainerState::Running => break,
            scheduler::ContainerState::Unknown
            | scheduler::ContainerState::Paused
            | scheduler::ContainerState::Restarting => {
                attempts += 1;
                continue;
            }
            scheduler::ContainerState::Exited => {
                bail!(
                    "Could not start extension container '{}'; Scheduler reported failed state; \
                    please check container logs for more info.",
                    container_id
                );
            }
        }
    }

    let scheme = if engine.config.extensions.use_tls {
        "https://"
    } else {
        "http://"
    };

    let extension_url = format!("{}{}", scheme, start_response.url.unwrap_or_default());

    let client = ExtensionClient::new(
        &extension_url,
        &extension_key,
        engine.config.extensions.verify_certs,
    )
    .context("Could not create extension client while attempting to start extension")?;

    // We wait in a polling loop to see if the extension is ready by hitting the health endpoint.
    debug!(
        id = registration.extension_id,
        url = extension_url,
        "Waiting for extension to be in ready state"
    );

    let mut attempts = 0;
    loop {
        if attempts >= EXTENSION_STARTUP_ATTEMPTS {
            bail!("Timed out while waiting for extension to be ready; extension unreachable.")
        }

        match client.health().await {
            Ok(_) => break,
            Err(e) => {
                debug!(
                    attempt = attempts,
                    error = %e,
                    "Waiting for extension to be in ready state"
                );
                attempts += 1;

                tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
            }
        };
    }

    let info_response = client
        .info()
        .await
        .context("Could not collect info from extension")?;

    let new_extension = Extension {
        registration: registration.clone(),
        url: extension_url.clone(),
        started: epoch_milli(),
        state: State::Running,
        documentation: info_response.documentation,
        secret: extension_key,
    };

    engine
        .extensions
        .insert(registration.extension_id.clone(), new_extension.clone());

    info!(
        id = registration.extension_id,
        url = extension_url,
        "Started extension"
    );

    Ok(new_extension)
}

/// Attempts to start each registered, enabled extension on the scheduler. An extension that
/// fails to start is reset to disabled so it doesn't block the rest of startup; the operator can
/// re-enable it after investigating.
pub async fn start_extensions(engine: Arc<Engine>) -> Result<()> {
    let registrations = {
        let mut conn = engine
            .storage
            .read_conn()
            .await
            .context("Could not open connection to database")?;

        storage::extension_registrations::list(&mut conn)
            .await
            .context("Could not list extensions while attempting to start all extensions")?
    };

    for registration_raw in registrations {
        let registration: Registration = registration_raw
            .try_into()
            .context("Could not parse extension registration")?;

        if registration.status != Status::Enabled {
            continue;
        }

        let extension_id = registration.extension_id.clone();

        if let Err(e) = start_extension(&engine, registration).await {
            error!(extension_id = extension_id, error = %e, "Could not start extension; disabling");

            let mut conn = engine
                .storage
                .write_conn()
                .await
                .context("Could not open connection to database")?;

            if let Err(update_err) = storage::extension_registrations::update(
                &mut conn,
                &extension_id,
                storage::extension_registrations::UpdatableFields {
                    status: Some(Status::Disabled.to_string()),
                    modified: epoch_milli().to_string(),
                    ..Default::default()
                },
            )
            .await
            {
                error!(extension_id = extension_id, error = %update_err,
                    "Could not disable extension after failed start");
            }
        }
    }

    Ok(())
}

/// Stops every running extension: best-effort call to the extension's own shutdown endpoint
/// first, then a container stop through the scheduler.
pub async fn stop_extensions(engine: &Arc<Engine>) {
    for extension in engine.extensions.iter() {
        let (id, extension) = extension.pair();

        match ExtensionClient::new(
            &extension.url,
            &extension.secret,
            engine.config.extensions.verify_certs,
        ) {
            Ok(client) => {
                if let Err(e) = client.shutdown().await {
                    debug!(extension_id = id, error = %e, "Could not call shutdown on extension");
                }
            }
            Err(e) => {
                error!(extension_id = id, error = %e,
                    "Could not create extension client while attempting to stop extensions");
            }
        };

        let container_id = extension_container_id(id);

        if let Err(e) = engine
            .scheduler
            .stop_container(scheduler::StopContainerRequest {
                id: container_id.clone(),
                timeout: engine.config.extensions.stop_timeout as i64,
            })
            .await
        {
            error!(container_id = container_id, error = %e, "Could not stop extension via scheduler");
        }
    }
}

/// Registers and starts a brand new extension. Installs are idempotent on the registration;
/// attempting to install an extension id that already exists returns an already-installed error.
pub async fn install_extension(
    engine: &Arc<Engine>,
    extension_id: &str,
    image: &str,
    registry_auth: Option<super::tasks::RegistryAuth>,
    settings: HashMap<String, String>,
) -> Result<(), EngineError> {
    is_valid_identifier(extension_id)
        .map_err(|e| EngineError::FailedPrecondition(e.to_string()))?;

    let registration = Registration {
        extension_id: extension_id.into(),
        image: image.into(),
        registry_auth,
        settings: settings
            .into_iter()
            .map(|(key, value)| Variable {
                key,
                value,
                source: VariableSource::System,
            })
            .collect(),
        created: epoch_milli(),
        modified: epoch_milli(),
        status: Status::Enabled,
    };

    let registration_storage: storage::extension_registrations::ExtensionRegistration =
        registration
            .clone()
            .try_into()
            .map_err(|e: anyhow::Error| EngineError::Unknown(e.to_string()))?;

    {
        let mut conn = engine.storage.write_conn().await.map_err(EngineError::from)?;

        storage::extension_registrations::insert(&mut conn, &registration_storage)
            .await
            .map_err(|e| match e {
                storage::StorageError::Exists => EngineError::Exists(format!(
                    "extension '{extension_id}' is already installed"
                )),
                _ => e.into(),
            })?;
    }

    if let Err(e) = start_extension(engine, registration).await {
        // A registration that can't start is reset to disabled; the operator can re-enable it
        // once the underlying problem is addressed.
        let mut conn = engine.storage.write_conn().await.map_err(EngineError::from)?;

        if let Err(update_err) = storage::extension_registrations::update(
            &mut conn,
            extension_id,
            storage::extension_registrations::UpdatableFields {
                status: Some(Status::Disabled.to_string()),
                modified: epoch_milli().to_string(),
                ..Default::default()
            },
        )
        .await
        {
            error!(extension_id = extension_id, error = %update_err,
                "Could not disable extension after failed start");
        }

        return Err(EngineError::Unknown(e.to_string()));
    }

    // Newly installed extensions start feeding the trigger event loop immediately.
    tokio::spawn(super::event_handlers::watch_extension(
        engine.clone(),
        extension_id.to_string(),
        engine.trigger_events.clone(),
    ));

    engine
        .event_bus
        .publish(event_utils::Kind::InstalledExtension {
            extension_id: extension_id.into(),
            image: image.into(),
        })
        .await;

    Ok(())
}

/// Removes an extension: stops the container, evicts the runtime cache entry, and deletes the
/// registration (cascading away its subscriptions).
pub async fn uninstall_extension(
    engine: &Arc<Engine>,
    extension_id: &str,
) -> Result<(), EngineError> {
    let extension = engine
        .extensions
        .remove(extension_id)
        .map(|(_, extension)| extension);

    if let Some(extension) = &extension {
        if let Ok(client) = ExtensionClient::new(
            &extension.url,
            &extension.secret,
            engine.config.extensions.verify_certs,
        ) {
            if let Err(e) = client.shutdown().await {
                debug!(extension_id = extension_id, error = %e, "Could not call shutdown on extension");
            }
        }

        if let Err(e) = engine
            .scheduler
            .stop_container(scheduler::StopContainerRequest {
                id: extension_container_id(extension_id),
                timeout: engine.config.extensions.stop_timeout as i64,
            })
            .await
        {
            debug!(extension_id = extension_id, error = %e, "Could not stop extension container during uninstall");
        }
    }

    let image = {
        let mut conn = engine.storage.write_conn().await.map_err(EngineError::from)?;

        let registration = storage::extension_registrations::get(&mut conn, extension_id)
            .await
            .map_err(|e| match e {
                storage::StorageError::NotFound => EngineError::NotFound(format!(
                    "extension '{extension_id}' is not installed"
                )),
                _ => e.into(),
            })?;

        storage::extension_registrations::delete(&mut conn, extension_id)
            .await
            .map_err(EngineError::from)?;

        registration.image
    };

    engine
        .event_bus
        .publish(event_utils::Kind::UninstalledExtension {
            extension_id: extension_id.into(),
            image,
        })
        .await;

    Ok(())
}

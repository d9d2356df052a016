use crate::engine::{
    event_utils, extensions, interpolate_vars, Engine, EngineError, Variable, VariableSource,
};
use crate::storage;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use strum::{Display, EnumString};
use tracing::{error, info};

#[derive(
    Debug, Clone, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum Status {
    #[default]
    Unknown,

    /// The extension has acknowledged the subscription.
    Active,

    /// The extension rejected the subscription or could not be reached while restoring it.
    Error,

    /// Disabled by a user.
    Disabled,
}

#[derive(
    Debug, Clone, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum StatusReasonType {
    #[default]
    Unknown,

    NotFound,

    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusReason {
    /// The specific type of subscription failure.
    pub reason: StatusReasonType,

    /// A description of why the subscription might have failed and what was going on at the time.
    pub description: String,
}

/// A binding from a pipeline to an extension: "when this extension fires an event under this
/// label, this pipeline cares". The settings blob is extension specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subscription {
    /// Unique identifier of the target namespace.
    pub namespace_id: String,

    /// Unique identifier of the target pipeline.
    pub pipeline_id: String,

    /// Unique identifier of the target extension.
    pub extension_id: String,

    /// A unique label differentiating this subscription from other subscriptions of the same
    /// pipeline to the same extension.
    pub subscription_id: String,

    /// The extension specific subscription settings.
    pub settings: HashMap<String, String>,

    /// The state of the subscription.
    pub status: Status,

    /// A further description about the status.
    pub status_reason: Option<StatusReason>,
}

impl TryFrom<storage::extension_subscriptions::ExtensionSubscription> for Subscription {
    type Error = anyhow::Error;

    fn try_from(value: storage::extension_subscriptions::ExtensionSubscription) -> Result<Self> {
        let settings = serde_json::from_str(&value.settings).with_context(|| {
            format!(
                "Could not parse field 'settings' from storage value '{}'",
                value.settings
            )
        })?;

        let status = Status::from_str(&value.status).with_context(|| {
            format!(
                "Could not parse field 'status' from storage value '{}'",
                value.status
            )
        })?;

        let status_reason = if value.status_reason.is_empty() {
            None
        } else {
            serde_json::from_str(&value.status_reason).with_context(|| {
                format!(
                    "Could not parse field 'status_reason' from storage value '{}'",
                    value.status_reason
                )
            })?
        };

        Ok(Subscription {
            namespace_id: value.namespace_id,
            pipeline_id: value.pipeline_id,
            extension_id: value.extension_id,
            subscription_id: value.subscription_id,
            settings,
            status,
            status_reason,
        })
    }
}

impl TryFrom<Subscription> for storage::extension_subscriptions::ExtensionSubscription {
    type Error = anyhow::Error;

    fn try_from(value: Subscription) -> Result<Self> {
        let settings = serde_json::to_string(&value.settings)
            .context("Could not serialize field 'settings' to storage value")?;

        let status_reason = match &value.status_reason {
            Some(reason) => serde_json::to_string(reason)
                .context("Could not serialize field 'status_reason' to storage value")?,
            None => String::new(),
        };

        Ok(Self {
            namespace_id: value.namespace_id,
            pipeline_id: value.pipeline_id,
            extension_id: value.extension_id,
            subscription_id: value.subscription_id,
            settings,
            status: value.status.to_string(),
            status_reason,
        })
    }
}

/// Tells the extension about the new subscription and then persists it. Settings values support
/// the usual interpolation syntax so pipelines can hand secrets to extensions without writing
/// them into their config.
pub async fn subscribe_extension(
    engine: &Engine,
    namespace_id: &str,
    pipeline_id: &str,
    extension_id: &str,
    subscription_id: &str,
    settings: HashMap<String, String>,
) -> Result<Subscription, EngineError> {
    let extension = engine
        .extensions
        .get(extension_id)
        .map(|extension| extension.value().clone())
        .ok_or_else(|| {
            EngineError::NotFound(format!("extension '{extension_id}' is not installed"))
        })?;

    let settings_variables: Vec<Variable> = settings
        .iter()
        .map(|(key, value)| Variable {
            key: key.clone(),
            value: value.clone(),
            source: VariableSource::PipelineConfig,
        })
        .collect();

    let interpolated =
        interpolate_vars(engine, namespace_id, pipeline_id, None, &settings_variables)
            .await
            .map_err(|e| EngineError::FailedPrecondition(e.to_string()))?;

    let interpolated_settings: HashMap<String, String> = interpolated
        .into_iter()
        .map(|variable| (variable.key, variable.value))
        .collect();

    let client = extensions::ExtensionClient::new(
        &extension.url,
        &extension.secret,
        engine.config.extensions.verify_certs,
    )
    .map_err(|e| EngineError::Unknown(e.to_string()))?;

    client
        .subscribe(&extensions::SubscribeRequest {
            namespace_id: namespace_id.into(),
            pipeline_id: pipeline_id.into(),
            subscription_id: subscription_id.into(),
            settings: interpolated_settings,
        })
        .await
        .map_err(|e| {
            EngineError::FailedPrecondition(format!(
                "extension '{extension_id}' rejected the subscription; {e}"
            ))
        })?;

    let subscription = Subscription {
        namespace_id: namespace_id.into(),
        pipeline_id: pipeline_id.into(),
        extension_id: extension_id.into(),
        subscription_id: subscription_id.into(),
        settings,
        status: Status::Active,
        status_reason: None,
    };

    let subscription_storage: storage::extension_subscriptions::ExtensionSubscription =
        subscription
            .clone()
            .try_into()
            .map_err(|e: anyhow::Error| EngineError::Unknown(e.to_string()))?;

    {
        let mut conn = engine.storage.write_conn().await.map_err(EngineError::from)?;

        storage::extension_subscriptions::insert(&mut conn, &subscription_storage)
            .await
            .map_err(|e| match e {
                storage::StorageError::Exists => EngineError::Exists(format!(
                    "subscription '{subscription_id}' already exists for extension '{extension_id}'"
                )),
                _ => e.into(),
            })?;
    }

    engine
        .event_bus
        .publish(event_utils::Kind::SubscribedPipelineExtension {
            namespace_id: namespace_id.into(),
            pipeline_id: pipeline_id.into(),
            extension_id: extension_id.into(),
            subscription_id: subscription_id.into(),
        })
        .await;

    Ok(subscription)
}

/// Tells the extension the subscription is gone and removes it from storage.
pub async fn unsubscribe_extension(
    engine: &Engine,
    namespace_id: &str,
    pipeline_id: &str,
    extension_id: &str,
    subscription_id: &str,
) -> Result<(), EngineError> {
    if let Some(extension) = engine.extensions.get(extension_id) {
        let client = extensions::ExtensionClient::new(
            &extension.url,
            &extension.secret,
            engine.config.extensions.verify_certs,
        )
        .map_err(|e| EngineError::Unknown(e.to_string()))?;

        if let Err(e) = client
            .unsubscribe(&extensions::UnsubscribeRequest {
                namespace_id: namespace_id.into(),
                pipeline_id: pipeline_id.into(),
                subscription_id: subscription_id.into(),
            })
            .await
        {
            // Unsubscribing from the extension side is best effort; the subscription row is the
            // source of truth.
            error!(extension_id = extension_id, error = %e, "Could not unsubscribe from extension");
        }
    }

    {
        let mut conn = engine.storage.write_conn().await.map_err(EngineError::from)?;

        storage::extension_subscriptions::delete(
            &mut conn,
            namespace_id,
            pipeline_id,
            extension_id,
            subscription_id,
        )
        .await
        .map_err(|e| match e {
            storage::StorageError::NotFound => EngineError::NotFound(format!(
                "subscription '{subscription_id}' does not exist for extension '{extension_id}'"
            )),
            _ => e.into(),
        })?;
    }

    engine
        .event_bus
        .publish(event_utils::Kind::UnsubscribedPipelineExtension {
            namespace_id: namespace_id.into(),
            pipeline_id: pipeline_id.into(),
            extension_id: extension_id.into(),
            subscription_id: subscription_id.into(),
        })
        .await;

    Ok(())
}

/// On restart extensions come up blank; replay every persisted subscription to its extension so
/// that trigger events flow again. A subscription that fails to validate is marked as errored
/// but does not abort startup.
pub async fn restore_extension_subscriptions(engine: &Engine) -> Result<()> {
    let subscriptions = {
        let mut conn = engine
            .storage
            .read_conn()
            .await
            .context("Could not open connection to database")?;

        storage::extension_subscriptions::list(&mut conn)
            .await
            .context("Could not list subscriptions while restoring extension subscriptions")?
    };

    for subscription_raw in subscriptions {
        let subscription: Subscription = match subscription_raw.try_into() {
            Ok(subscription) => subscription,
            Err(e) => {
                error!(error = %e, "Could not parse subscription while restoring extension subscriptions");
                continue;
            }
        };

        if subscription.status == Status::Disabled {
            continue;
        }

        let result = async {
            let extension = engine
                .extensions
                .get(&subscription.extension_id)
                .map(|extension| extension.value().clone())
                .ok_or_else(|| {
                    anyhow::anyhow!(
                        "extension '{}' is not running",
                        subscription.extension_id
                    )
                })?;

            let settings_variables: Vec<Variable> = subscription
                .settings
                .iter()
                .map(|(key, value)| Variable {
                    key: key.clone(),
                    value: value.clone(),
                    source: VariableSource::PipelineConfig,
                })
                .collect();

            let interpolated = interpolate_vars(
                engine,
                &subscription.namespace_id,
                &subscription.pipeline_id,
                None,
                &settings_variables,
            )
            .await?;

            let client = extensions::ExtensionClient::new(
                &extension.url,
                &extension.secret,
                engine.config.extensions.verify_certs,
            )?;

            client
                .subscribe(&extensions::SubscribeRequest {
                    namespace_id: subscription.namespace_id.clone(),
                    pipeline_id: subscription.pipeline_id.clone(),
                    subscription_id: subscription.subscription_id.clone(),
                    settings: interpolated
                        .into_iter()
                        .map(|variable| (variable.key, variable.value))
                        .collect(),
                })
                .await
        }
        .await;

        match result {
            Ok(_) => {
                info!(
                    namespace_id = subscription.namespace_id,
                    pipeline_id = subscription.pipeline_id,
                    extension_id = subscription.extension_id,
                    subscription_id = subscription.subscription_id,
                    "Restored extension subscription"
                );

                if subscription.status != Status::Active {
                    set_subscription_status(engine, &subscription, Status::Active, None).await;
                }
            }
            Err(e) => {
                error!(
                    namespace_id = subscription.namespace_id,
                    pipeline_id = subscription.pipeline_id,
                    extension_id = subscription.extension_id,
                    subscription_id = subscription.subscription_id,
                    error = %e,
                    "Could not restore extension subscription"
                );

                set_subscription_status(
                    engine,
                    &subscription,
                    Status::Error,
                    Some(StatusReason {
                        reason: StatusReasonType::Failed,
                        description: format!("Could not restore subscription; {e}"),
                    }),
                )
                .await;
            }
        }
    }

    Ok(())
}

async fn set_subscription_status(
    engine: &Engine,
    subscription: &Subscription,
    status: Status,
    reason: Option<StatusReason>,
) {
    let status_reason = reason.and_then(|value| serde_json::to_string(&value).ok());

    let mut conn = match engine.storage.write_conn().await {
        Ok(conn) => conn,
        Err(e) => {
            error!(error = %e, "Could not establish connection to database while updating subscription status");
            return;
        }
    };

    if let Err(e) = storage::extension_subscriptions::update(
        &mut conn,
        &subscription.namespace_id,
        &subscription.pipeline_id,
        &subscription.extension_id,
        &subscription.subscription_id,
        storage::extension_subscriptions::UpdatableFields {
            status: Some(status.to_string()),
            status_reason,
            ..Default::default()
        },
    )
    .await
    {
        error!(error = %e, "Could not update subscription status in storage");
    }
}

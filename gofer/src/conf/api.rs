use crate::conf::ConfigType;
use crate::{object_store, scheduler, secret_store};
use serde::Deserialize;
use std::path::PathBuf;

const DEFAULT_API_CONFIG: &str = include_str!("./default_api_config.toml");

#[derive(Deserialize, Default, Debug, Clone)]
pub struct ApiConfig {
    pub api: Api,
    pub development: Development,
    pub extensions: Extensions,
    pub external_events: ExternalEvents,
    pub scheduler: Scheduler,
    pub server: Server,
    pub object_store: ObjectStore,
    pub secret_store: SecretStore,
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Api {
    /// Controls how long Gofer will hold onto events before discarding them (in seconds).
    /// This is an important factor in disk space and memory footprint.
    ///
    /// Example: Rough math on a 5,000 pipeline Gofer instance with a full 6 months of retention
    /// puts the memory and storage footprint at about 9 GB.
    pub event_log_retention: u64,

    /// How often the background process for pruning events should run (in seconds).
    pub event_prune_interval: u64,

    /// The entire service's log level including extensions.
    pub log_level: String,

    /// The total amount of runs before logs of the oldest run will be deleted.
    pub task_execution_log_retention: u64,

    /// Directory to store task execution log files.
    pub task_execution_logs_dir: String,

    /// Time in seconds the scheduler will wait for a normal user container(not extension containers)
    /// to stop. When the timeout is reached the container will be forcefully terminated.
    /// You can use a timeout of 0 to convey that no timeout should be specified and the
    /// scheduler should kill all containers immediately.
    pub task_execution_stop_timeout: u64,
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Development {
    /// Tells the logging package to use human readable output.
    pub pretty_logging: bool,
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Extensions {
    /// The time in seconds the scheduler will wait for an extension container to stop. After this period Gofer will
    /// attempt to force stop the container.
    pub stop_timeout: u64,

    /// These are the paths to the certificate pieces the server will pass to each extension so that extensions can
    /// serve TLS.
    pub use_tls: bool,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,

    /// When attempting to communicate from Gofer to an extension verify the cert is correct and known.
    pub verify_certs: bool,
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct ExternalEvents {
    pub enable: bool,
    pub bind_address: String,
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Scheduler {
    pub engine: scheduler::Engine,
    pub docker: Option<scheduler::docker::Config>,
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Server {
    /// The URL that users use to interact with Gofer. Should be the full uri to the root. Ex. http://example.org
    pub url: String,

    /// URL for the Gofer API that can be contacted by extensions. This is important due to extensions likely being
    /// part of a local network and as such they need a different address than the default 'url' address.
    ///
    /// For example, development for Gofer is done locally and that requires us to set this address to the 'docker host'
    /// address such that when extensions make a request they make it through the proper network stack.
    pub extension_address: String,

    /// Path to Gofer's database.
    pub storage_path: String,
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct ObjectStore {
    /// The ObjectStore engine used by the backend.
    pub engine: object_store::Engine,

    /// Pipeline objects last forever but are limited in number. This is the total amount of objects that can be stored
    /// per pipeline before Gofer starts evicting the oldest objects, operating in a ring buffer fashion.
    pub pipeline_object_limit: u64,

    /// The total amount of objects that can be stored per run before the oldest objects are evicted.
    pub run_object_limit: u64,

    /// How many runs until the run objects for the oldest run will be deleted.
    /// Ex. an object stored on run number #5 with an expiry of 2(only the last two runs keep their objects) will be
    /// deleted on run #7 regardless of run health.
    pub run_object_expiry: u64,

    pub filesystem: Option<object_store::filesystem::Config>,
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct SecretStore {
    /// The SecretStore engine used by the backend.
    pub engine: secret_store::Engine,
    pub sqlite: Option<secret_store::sqlite::Config>,
}

impl ConfigType for ApiConfig {
    fn default_config() -> &'static str {
        DEFAULT_API_CONFIG
    }

    fn config_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/gofer/gofer.toml")];

        if let Ok(home) = std::env::var("HOME") {
            paths.push(PathBuf::from(format!("{home}/.gofer.toml")));
        }

        paths
    }

    fn env_prefix() -> &'static str {
        "GOFER_"
    }
}

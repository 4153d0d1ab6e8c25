//! Process configuration and the deployment descriptor.
//!
//! Flags come from the command line or `PRESSURIZE_*` environment variables.
//! The descriptor (`pressurize.json`) lists the models to serve; only `name`,
//! `path`, `methods` and `required_resources` are read, everything else in it
//! belongs to the provisioning tooling and is ignored.

use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

lazy_static! {
    /// Model names double as URL path segments.
    static ref MODEL_NAME: Regex = Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid model name regex");
}

/// Command-line flags shared by the gateway and worker modes.
#[derive(Parser, Debug, Clone)]
#[command(name = "pressurize", version, about = "Serve model predictions from isolated worker processes")]
pub struct ServerArgs {
    /// Deployment descriptor listing the models to serve.
    #[arg(long, env = "PRESSURIZE_DESCRIPTOR", default_value = "pressurize.json")]
    pub descriptor: PathBuf,

    #[arg(long, env = "PRESSURIZE_HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    #[arg(long, env = "PRESSURIZE_PORT", default_value_t = 5000)]
    pub port: u16,

    /// Directory downloaded resources are written into.
    #[arg(long, env = "PRESSURIZE_RESOURCE_DIR", default_value = "resources")]
    pub resource_dir: PathBuf,

    /// Where `blob://` resources are fetched from: a local directory or an http(s) base URL.
    #[arg(long, env = "PRESSURIZE_BLOB_ENDPOINT")]
    pub blob_endpoint: Option<String>,

    #[arg(long, env = "PRESSURIZE_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    pub request_timeout_secs: u64,

    #[arg(long, env = "PRESSURIZE_STARTUP_TIMEOUT_SECS", default_value_t = 120)]
    pub startup_timeout_secs: u64,

    /// Supervised restarts allowed per model before it is given up on.
    #[arg(long, env = "PRESSURIZE_MAX_RESTARTS", default_value_t = 3)]
    pub max_restarts: u32,

    /// Retries for transient blob download failures.
    #[arg(long, env = "PRESSURIZE_DOWNLOAD_RETRIES", default_value_t = 3)]
    pub download_retries: u32,

    /// Largest request body accepted, in bytes.
    #[arg(long, env = "PRESSURIZE_MAX_BODY_BYTES", default_value_t = 16 * 1024 * 1024)]
    pub max_body_bytes: usize,

    #[arg(long, env = "PRESSURIZE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "PRESSURIZE_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Run as a model worker (spawned by the gateway, not by hand).
    #[arg(long, hide = true)]
    pub worker: bool,

    /// Model served by this worker.
    #[arg(long, hide = true, requires = "worker")]
    pub model: Option<String>,
}

impl ServerArgs {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    /// Arguments a worker for `model` is started with. The worker re-reads
    /// the same descriptor and resolves resources with the same settings.
    pub fn worker_args(&self, model: &str) -> Vec<String> {
        let mut args = vec![
            "--worker".to_string(),
            "--model".to_string(),
            model.to_string(),
            "--descriptor".to_string(),
            self.descriptor.display().to_string(),
            "--resource-dir".to_string(),
            self.resource_dir.display().to_string(),
            "--download-retries".to_string(),
            self.download_retries.to_string(),
            "--log-level".to_string(),
            self.log_level.clone(),
        ];
        if let Some(endpoint) = &self.blob_endpoint {
            args.push("--blob-endpoint".to_string());
            args.push(endpoint.clone());
        }
        if let Some(log_file) = &self.log_file {
            args.push("--log-file".to_string());
            args.push(log_file.display().to_string());
        }
        args
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read deployment descriptor {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid deployment descriptor: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid model name '{0}' (allowed: letters, digits, '_' and '-')")]
    InvalidName(String),
    #[error("model '{0}' is declared more than once")]
    DuplicateName(String),
}

/// One entry of the descriptor's `models` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    /// Code reference of the implementation, e.g. `TestModel.TestModel`.
    pub path: String,
    /// Methods callers may invoke. Empty exposes everything the model provides.
    #[serde(default)]
    pub methods: Vec<String>,
    /// Logical resource name -> URI (`blob://bucket/key` or a literal value).
    #[serde(default)]
    pub required_resources: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentDescriptor {
    pub models: Vec<ModelConfig>,
}

impl DeploymentDescriptor {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let descriptor: Self = serde_json::from_str(raw)?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for model in &self.models {
            if !MODEL_NAME.is_match(&model.name) {
                return Err(ConfigError::InvalidName(model.name.clone()));
            }
            if !seen.insert(model.name.as_str()) {
                return Err(ConfigError::DuplicateName(model.name.clone()));
            }
        }
        Ok(())
    }

    pub fn model(&self, name: &str) -> Option<&ModelConfig> {
        self.models.iter().find(|m| m.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTOR: &str = r#"{
        "deployment_name": "pressurizetest",
        "aws_region": "us-west-2",
        "models": [
            {
                "name": "TestModel",
                "path": "TestModel.TestModel",
                "methods": ["predict"],
                "required_resources": {"parameters": "blob://bucket/TestModel/parameters.txt"},
                "min_memory_per_instance": ["1024"]
            },
            {"name": "Echo", "path": "Echo.Echo"}
        ]
    }"#;

    #[test]
    fn test_descriptor_ignores_provisioning_fields() {
        let descriptor = DeploymentDescriptor::from_json(DESCRIPTOR).unwrap();
        assert_eq!(descriptor.models.len(), 2);

        let test_model = descriptor.model("TestModel").unwrap();
        assert_eq!(test_model.path, "TestModel.TestModel");
        assert_eq!(test_model.methods, vec!["predict".to_string()]);
        assert_eq!(
            test_model.required_resources.get("parameters").map(String::as_str),
            Some("blob://bucket/TestModel/parameters.txt")
        );

        let echo = descriptor.model("Echo").unwrap();
        assert!(echo.methods.is_empty());
        assert!(echo.required_resources.is_empty());
        assert!(descriptor.model("Ghost").is_none());
    }

    #[test]
    fn test_descriptor_rejects_duplicate_names() {
        let raw = r#"{"models": [{"name": "A", "path": "A.A"}, {"name": "A", "path": "B.B"}]}"#;
        assert!(matches!(
            DeploymentDescriptor::from_json(raw),
            Err(ConfigError::DuplicateName(name)) if name == "A"
        ));
    }

    #[test]
    fn test_descriptor_rejects_names_unusable_in_urls() {
        let raw = r#"{"models": [{"name": "my model/v1", "path": "A.A"}]}"#;
        assert!(matches!(
            DeploymentDescriptor::from_json(raw),
            Err(ConfigError::InvalidName(_))
        ));
    }

    #[test]
    fn test_descriptor_rejects_non_string_resources() {
        let raw = r#"{"models": [{"name": "A", "path": "A.A", "required_resources": {"n": 3}}]}"#;
        assert!(matches!(
            DeploymentDescriptor::from_json(raw),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_server_args_defaults() {
        let args = ServerArgs::try_parse_from(["pressurize"]).unwrap();
        assert_eq!(args.port, 5000);
        assert_eq!(args.bind_addr().to_string(), "0.0.0.0:5000");
        assert_eq!(args.request_timeout(), Duration::from_secs(30));
        assert_eq!(args.max_body_bytes, crate::web::gateway::DEFAULT_BODY_LIMIT);
        assert!(!args.worker);
    }

    #[test]
    fn test_worker_args_round_trip_through_parser() {
        let args = ServerArgs::try_parse_from([
            "pressurize",
            "--descriptor",
            "deploy/pressurize.json",
            "--blob-endpoint",
            "/srv/blobs",
            "--download-retries",
            "5",
            "--log-file",
            "logs/pressurize.log",
        ])
        .unwrap();

        let mut argv = vec!["pressurize".to_string()];
        argv.extend(args.worker_args("TestModel"));
        let worker = ServerArgs::try_parse_from(argv).unwrap();

        assert!(worker.worker);
        assert_eq!(worker.model.as_deref(), Some("TestModel"));
        assert_eq!(worker.descriptor, PathBuf::from("deploy/pressurize.json"));
        assert_eq!(worker.blob_endpoint.as_deref(), Some("/srv/blobs"));
        assert_eq!(worker.download_retries, 5);
        assert_eq!(worker.log_file, Some(PathBuf::from("logs/pressurize.log")));
    }

    #[test]
    fn test_model_flag_requires_worker_mode() {
        assert!(ServerArgs::try_parse_from(["pressurize", "--model", "TestModel"]).is_err());
    }
}

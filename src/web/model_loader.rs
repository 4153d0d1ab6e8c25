//! Resolves a descriptor's code reference to a registered model factory and
//! builds the model's capability table.
//!
//! Models are registered in a [`ModelCatalog`] by the binary that embeds the
//! server; there is no loading of code from the filesystem.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use lazy_static::lazy_static;
use log::info;
use regex::Regex;
use thiserror::Error;

use super::config::ModelConfig;
use super::models::{ModelError, ModelInstance};
use super::resources::ResolvedResources;

lazy_static! {
    static ref SEGMENT: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid segment regex");
}

/// Builds one model instance from its resolved resources.
pub type ModelFactory = fn(&ResolvedResources) -> Result<Box<dyn ModelInstance>, ModelError>;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("invalid code reference '{0}' (expected dotted identifiers, e.g. Package.Model)")]
    InvalidReference(String),
    #[error("no model registered for code reference '{0}'")]
    UnknownReference(String),
    #[error("model '{reference}' failed to construct: {cause}")]
    Construction { reference: String, cause: String },
    #[error("model '{reference}' does not provide whitelisted method(s): {}", .methods.join(", "))]
    MissingMethods {
        reference: String,
        methods: Vec<String>,
    },
}

/// Dotted path naming a model implementation; the last segment is the symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeReference {
    segments: Vec<String>,
}

impl CodeReference {
    pub fn parse(raw: &str) -> Result<Self, LoadError> {
        let segments: Vec<String> = raw.split('.').map(str::to_string).collect();
        if segments.iter().any(|s| !SEGMENT.is_match(s)) {
            return Err(LoadError::InvalidReference(raw.to_string()));
        }
        Ok(Self { segments })
    }

    pub fn symbol(&self) -> &str {
        self.segments.last().map_or("", String::as_str)
    }

    pub fn canonical(&self) -> String {
        self.segments.join(".")
    }
}

/// Registration table: code reference -> factory.
#[derive(Clone, Default)]
pub struct ModelCatalog {
    factories: BTreeMap<String, ModelFactory>,
}

impl fmt::Debug for ModelCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.factories.keys()).finish()
    }
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, reference: &str, factory: ModelFactory) -> Self {
        self.factories.insert(reference.to_string(), factory);
        self
    }

    pub fn references(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    fn factory(&self, reference: &CodeReference) -> Option<ModelFactory> {
        self.factories.get(&reference.canonical()).copied()
    }
}

/// Instantiate the model `config` names, exactly once, and narrow it to the
/// whitelisted methods.
pub fn load_model(
    catalog: &ModelCatalog,
    config: &ModelConfig,
    resources: &ResolvedResources,
) -> Result<Box<dyn ModelInstance>, LoadError> {
    let reference = CodeReference::parse(&config.path)?;
    let factory = catalog
        .factory(&reference)
        .ok_or_else(|| LoadError::UnknownReference(config.path.clone()))?;

    info!(
        "[LOADER] Constructing {} for model '{}'",
        reference.symbol(),
        config.name
    );
    let mut instance = match panic::catch_unwind(AssertUnwindSafe(|| factory(resources))) {
        Ok(Ok(instance)) => instance,
        Ok(Err(e)) => {
            return Err(LoadError::Construction {
                reference: config.path.clone(),
                cause: e.to_string(),
            })
        }
        Err(panic_info) => {
            return Err(LoadError::Construction {
                reference: config.path.clone(),
                cause: panic_message(&*panic_info),
            })
        }
    };

    if !config.methods.is_empty() {
        instance
            .restrict(&config.methods)
            .map_err(|methods| LoadError::MissingMethods {
                reference: config.path.clone(),
                methods,
            })?;
    }
    info!(
        "[LOADER] Model '{}' loaded with methods [{}]",
        config.name,
        instance.capabilities().join(", ")
    );
    Ok(instance)
}

/// Best-effort text of a caught panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

//! Models bundled with the server binary.

use std::fs;
use std::path::PathBuf;

use serde_json::{json, Value};

use super::model_loader::ModelCatalog;
use super::models::{instance, MethodTable, ModelError, ServableModel};
use super::resources::ResolvedResources;

/// Catalog of the bundled models.
pub fn catalog() -> ModelCatalog {
    ModelCatalog::new()
        .register("TestModel.TestModel", |resources| {
            Ok(instance(TestModel::new(resources)))
        })
        .register("Echo.Echo", |_| Ok(instance(Echo)))
}

/// Increments `data.number` and reports the `parameters` resource.
#[derive(Debug)]
pub struct TestModel {
    parameters: Option<PathBuf>,
}

impl TestModel {
    pub fn new(resources: &ResolvedResources) -> Self {
        Self {
            parameters: resources.get("parameters").map(PathBuf::from),
        }
    }

    fn predict(&mut self, payload: Value) -> Result<Value, ModelError> {
        let number = payload.pointer("/data/number").cloned().unwrap_or(Value::Null);
        let parameters = match &self.parameters {
            Some(path) => {
                log::debug!("Reading parameters from {}", path.display());
                Value::String(fs::read_to_string(path)?.trim().to_string())
            }
            None => Value::Null,
        };
        Ok(json!({
            "status": "success",
            "number": number,
            "parameters": parameters,
        }))
    }

    fn fail(&mut self, _payload: Value) -> Result<Value, ModelError> {
        Err(ModelError::new("TestModel.fail always fails"))
    }
}

impl ServableModel for TestModel {
    fn preprocess(&mut self, mut payload: Value) -> Result<Value, ModelError> {
        let number = payload
            .pointer_mut("/data/number")
            .ok_or_else(|| ModelError::new("'data.number' is required"))?;
        let n = number
            .as_i64()
            .ok_or_else(|| ModelError::new("'data.number' must be an integer"))?;
        *number = json!(n + 1);
        Ok(payload)
    }

    fn methods() -> MethodTable<Self> {
        MethodTable::new()
            .with("predict", Self::predict)
            .with("fail", Self::fail)
    }
}

/// Returns whatever it is given.
#[derive(Debug)]
pub struct Echo;

impl Echo {
    fn echo(&mut self, payload: Value) -> Result<Value, ModelError> {
        Ok(payload)
    }
}

impl ServableModel for Echo {
    fn methods() -> MethodTable<Self> {
        MethodTable::new().with("echo", Self::echo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preprocess_then_predict() {
        let mut model = instance(TestModel::new(&ResolvedResources::new()));
        let pre = model.preprocess(json!({"data": {"number": 41}})).unwrap();
        let result = model.call("predict", pre).unwrap();
        assert_eq!(
            result,
            json!({"status": "success", "number": 42, "parameters": null})
        );
    }

    #[test]
    fn test_predict_reads_parameters_resource() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parameters.txt");
        fs::write(&path, "123\n").unwrap();
        let mut resources = ResolvedResources::new();
        resources.insert("parameters".to_string(), path.display().to_string());

        let mut model = instance(TestModel::new(&resources));
        let result = model.call("predict", json!({"data": {"number": 1}})).unwrap();
        assert_eq!(result["parameters"], json!("123"));
    }

    #[test]
    fn test_preprocess_requires_number() {
        let mut model = instance(TestModel::new(&ResolvedResources::new()));
        let err = model.preprocess(json!({"data": {}})).unwrap_err();
        assert_eq!(err.message(), "'data.number' is required");
    }

    #[test]
    fn test_catalog_references() {
        let catalog = catalog();
        let refs: Vec<&str> = catalog.references().collect();
        assert_eq!(refs, vec!["Echo.Echo", "TestModel.TestModel"]);
    }
}

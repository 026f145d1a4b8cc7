use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use widgetsync_shared::Value;

use crate::model::{ModelHandle, ModuleInfo};

/// Keys that never sync: parent/child back-references the rendering layer
/// maintains on its own.
const DEFAULT_TRANSIENT_KEYS: &[&str] = &["children"];

/// Per-key transform pair for one model type. `serialize` runs on the way
/// out to the shared table, `deserialize` on the way in. Both operate on
/// resolved values; reference unpacking is the engine's job, not the
/// serializer's.
pub trait KeySerializer: Send + Sync {
    fn serialize(&self, value: &Value<ModelHandle>) -> Result<Value<ModelHandle>, String> {
        Ok(value.clone())
    }

    fn deserialize(&self, value: Value<ModelHandle>) -> Result<Value<ModelHandle>, String> {
        Ok(value)
    }
}

/// Identity transform, the default for every key without a registered
/// serializer.
struct IdentitySerializer;

impl KeySerializer for IdentitySerializer {}

/// The serialization contract of one model type, resolved once at
/// registration time.
pub struct ModelSchema {
    serializers: HashMap<String, Arc<dyn KeySerializer>>,
    transient_keys: HashSet<String>,
}

impl ModelSchema {
    pub fn new() -> Self {
        Self {
            serializers: HashMap::new(),
            transient_keys: DEFAULT_TRANSIENT_KEYS
                .iter()
                .map(|key| key.to_string())
                .collect(),
        }
    }

    pub fn with_serializer(
        mut self,
        key: impl Into<String>,
        serializer: Arc<dyn KeySerializer>,
    ) -> Self {
        self.serializers.insert(key.into(), serializer);
        self
    }

    pub fn with_transient_key(mut self, key: impl Into<String>) -> Self {
        self.transient_keys.insert(key.into());
        self
    }

    pub fn serializer(&self, key: &str) -> Option<&Arc<dyn KeySerializer>> {
        self.serializers.get(key)
    }

    pub fn is_transient(&self, key: &str) -> bool {
        self.transient_keys.contains(key)
    }
}

impl Default for ModelSchema {
    fn default() -> Self {
        Self::new()
    }
}

/// All registered model-type schemas for one session, keyed by
/// `(model_module, model_name)`. Types without a registration get the
/// default identity schema.
pub struct SchemaRegistry {
    schemas: HashMap<(String, String), Arc<ModelSchema>>,
    default: Arc<ModelSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self {
            schemas: HashMap::new(),
            default: Arc::new(ModelSchema::new()),
        }
    }

    pub fn register(
        &mut self,
        model_module: impl Into<String>,
        model_name: impl Into<String>,
        schema: ModelSchema,
    ) {
        self.schemas
            .insert((model_module.into(), model_name.into()), Arc::new(schema));
    }

    pub fn resolve(&self, module: &ModuleInfo) -> Arc<ModelSchema> {
        self.schemas
            .get(&(module.model_module.clone(), module.model_name.clone()))
            .unwrap_or(&self.default)
            .clone()
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn children_is_transient_by_default() {
        let schema = ModelSchema::new();
        assert!(schema.is_transient("children"));
        assert!(!schema.is_transient("value"));
    }

    #[test]
    fn unregistered_type_gets_default_schema() {
        let registry = SchemaRegistry::new();
        let module = ModuleInfo {
            model_name: "SliderModel".to_string(),
            model_module: "controls".to_string(),
            module_version: "2.0.0".to_string(),
        };
        let schema = registry.resolve(&module);
        assert!(schema.serializer("value").is_none());
    }

    #[test]
    fn registered_schema_is_resolved_by_module_and_name() {
        struct Rejecting;
        impl KeySerializer for Rejecting {
            fn deserialize(
                &self,
                _value: Value<ModelHandle>,
            ) -> Result<Value<ModelHandle>, String> {
                Err("rejected".to_string())
            }
        }

        let mut registry = SchemaRegistry::new();
        registry.register(
            "controls",
            "SliderModel",
            ModelSchema::new().with_serializer("value", Arc::new(Rejecting)),
        );

        let module = ModuleInfo {
            model_name: "SliderModel".to_string(),
            model_module: "controls".to_string(),
            module_version: "2.0.0".to_string(),
        };
        let schema = registry.resolve(&module);
        let err = schema
            .serializer("value")
            .expect("registered serializer")
            .deserialize(Value::Null)
            .expect_err("rejects");
        assert_eq!(err, "rejected");
    }
}

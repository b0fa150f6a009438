use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

/// The model a session is working with and its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelContext {
    pub model: String,
    pub parameters: Map<String, Value>,
}

impl ModelContext {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            parameters: Map::new(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Validates the `{ model, parameters }` shape.
    ///
    /// Extra top-level keys are rejected: a context read back must equal the
    /// one that was stored.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut fields) = value else {
            return Err(Error::InvalidContext("expected an object".into()));
        };

        let model = match fields.remove("model") {
            Some(Value::String(model)) if !model.is_empty() => model,
            Some(Value::String(_)) => {
                return Err(Error::InvalidContext("`model` must not be empty".into()));
            }
            Some(_) => return Err(Error::InvalidContext("`model` must be a string".into())),
            None => return Err(Error::InvalidContext("missing `model`".into())),
        };

        let parameters = match fields.remove("parameters") {
            Some(Value::Object(parameters)) => parameters,
            Some(_) => {
                return Err(Error::InvalidContext(
                    "`parameters` must be an object".into(),
                ));
            }
            None => return Err(Error::InvalidContext("missing `parameters`".into())),
        };

        if let Some(key) = fields.keys().next() {
            return Err(Error::InvalidContext(format!("unexpected field `{key}`")));
        }

        Ok(Self { model, parameters })
    }
}

/// Holds one session's model context.
///
/// Only the owning session's requests reach the store, so the lock is never
/// contended across sessions.
#[derive(Debug, Default)]
pub struct ModelContextStore {
    current: Mutex<Option<ModelContext>>,
}

impl ModelContextStore {
    pub async fn get(&self) -> Option<ModelContext> {
        self.current.lock().await.clone()
    }

    /// Replaces the context, returning the previous one.
    pub async fn set(&self, context: ModelContext) -> Option<ModelContext> {
        self.current.lock().await.replace(context)
    }

    pub async fn clear(&self) -> Option<ModelContext> {
        self.current.lock().await.take()
    }

    pub async fn is_set(&self) -> bool {
        self.current.lock().await.is_some()
    }
}

//! Scoped store of attributes published while a session is being built.

use crate::error::{TrainingError, TrainingResult};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Attributes exposed by already-built objects, read by later constructors
/// through `dynamic_kwargs`.
///
/// One context lives for exactly one session build; nothing leaks into the
/// next build.
#[derive(Debug, Default)]
pub struct BuildContext {
    attributes: BTreeMap<String, Value>,
}

impl BuildContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&mut self, name: &str, value: Value) {
        debug!(attribute = %name, "Publishing build attribute");
        if self.attributes.insert(name.to_string(), value).is_some() {
            warn!(attribute = %name, "Build attribute replaced");
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// Literal kwargs extended with the resolved dynamic ones.
    pub fn resolve_kwargs(
        &self,
        kwargs: &Map<String, Value>,
        dynamic_kwargs: &BTreeMap<String, String>,
    ) -> TrainingResult<Map<String, Value>> {
        let mut resolved = kwargs.clone();
        for (kwarg, attribute) in dynamic_kwargs {
            let value = self.attributes.get(attribute).ok_or_else(|| {
                TrainingError::InvalidSpec(format!(
                    "dynamic kwarg `{kwarg}` refers to unknown attribute `{attribute}`; published: [{}]",
                    self.attributes.keys().cloned().collect::<Vec<_>>().join(", ")
                ))
            })?;
            resolved.insert(kwarg.clone(), value.clone());
        }
        Ok(resolved)
    }
}

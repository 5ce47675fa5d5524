use longform_core::{ModelClass, ProviderConfig};

use crate::error::AdapterError;

/// Model name per model class for one provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelNames {
    planning: String,
    drafting: String,
}

impl ModelNames {
    pub fn new(planning: impl Into<String>, drafting: impl Into<String>) -> Self {
        Self {
            planning: planning.into(),
            drafting: drafting.into(),
        }
    }

    pub fn from_config(name: &str, config: &ProviderConfig) -> Result<Self, AdapterError> {
        let names = Self::new(
            config.model_for(ModelClass::Planning).trim(),
            config.model_for(ModelClass::Drafting).trim(),
        );
        for class in ModelClass::ALL {
            if names.get(class).is_empty() {
                return Err(AdapterError::InvalidConfig(format!(
                    "provider `{name}` has no model for class `{class}`"
                )));
            }
        }
        Ok(names)
    }

    pub fn get(&self, class: ModelClass) -> &str {
        match class {
            ModelClass::Planning => &self.planning,
            ModelClass::Drafting => &self.drafting,
        }
    }
}

use super::builtin;
use super::types::{OutputType, SingleResult};
use crate::model::{ModelError, Resource};
use crate::subprocess::SubprocessError;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Converter already registered for ({output_type}, {mime})")]
    Duplicate { output_type: OutputType, mime: String },
}

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("No converter for ({output_type}, {mime})")]
    NoConverter { output_type: OutputType, mime: String },

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Converter failed: {0}")]
    Subprocess(#[from] SubprocessError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConversionError {
    pub fn is_missing(&self) -> bool {
        matches!(self, ConversionError::Model(err) if err.is_missing())
    }
}

/// Extracts a value from a resource whose type is the given MIME type.
pub type Converter =
    Box<dyn Fn(&Resource<'_>, &str) -> Result<Option<Value>, ConversionError> + Send + Sync>;

type Key = (OutputType, Option<String>);

/// Converters keyed by output type and MIME type, with `None` as the
/// per-output-type wildcard.
#[derive(Default)]
pub struct ConversionRegistry {
    converters: BTreeMap<Key, Converter>,
}

impl ConversionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in converters.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for (output_type, mime, converter) in builtin::defaults() {
            // The built-in table has unique keys.
            registry.converters.insert((output_type, mime.map(str::to_string)), converter);
        }
        registry
    }

    /// Adds a converter. Fails if one is already registered for the key.
    pub fn register<F>(
        &mut self,
        output_type: OutputType,
        mime: Option<&str>,
        converter: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(&Resource<'_>, &str) -> Result<Option<Value>, ConversionError> + Send + Sync + 'static,
    {
        let key = (output_type, mime.map(str::to_string));
        if self.converters.contains_key(&key) {
            return Err(RegistryError::Duplicate {
                output_type,
                mime: mime.unwrap_or("*").to_string(),
            });
        }
        self.converters.insert(key, Box::new(converter));
        Ok(())
    }

    pub fn contains(&self, output_type: OutputType, mime: Option<&str>) -> bool {
        self.converters
            .contains_key(&(output_type, mime.map(str::to_string)))
    }

    /// Converts `resource` to `output_type`, computing its MIME type unless
    /// `mime` is given. The exact MIME entry wins over the wildcard.
    pub fn convert(
        &self,
        resource: &Resource<'_>,
        output_type: OutputType,
        mime: Option<&str>,
    ) -> Result<SingleResult, ConversionError> {
        let mime = match mime {
            Some(mime) => mime.to_string(),
            None => resource.compute_type()?,
        };

        let exact = (output_type, Some(mime.clone()));
        let (key, converter) = match self.converters.get_key_value(&exact) {
            Some(found) => found,
            None => self
                .converters
                .get_key_value(&(output_type, None))
                .ok_or_else(|| ConversionError::NoConverter {
                    output_type,
                    mime: mime.clone(),
                })?,
        };

        debug!(
            handle = %resource.handle(),
            output_type = %output_type,
            mime = %mime,
            wildcard = key.1.is_none(),
            "Converting"
        );
        let value = converter(resource, &mime)?;
        Ok(SingleResult {
            output_type,
            mime: key.1.clone(),
            value,
        })
    }
}

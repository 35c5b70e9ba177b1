//! Extraction of typed values from resources.

mod builtin;
mod registry;
mod types;

pub use registry::{ConversionError, ConversionRegistry, Converter, RegistryError};
pub use types::{OutputType, SingleResult};

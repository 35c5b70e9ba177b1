//! Sources, handles and resources.
//!
//! A [`Source`] describes a location, a [`Handle`] names one object inside
//! it and a [`Resource`] binds a handle to live sessions held by a
//! [`SourceManager`]. Containers found inside objects are explored through
//! a [`DerivedSourceTable`], driven recursively by a [`Walker`].

pub mod data;
pub mod derived;
pub mod dispatch;
mod error;
pub mod file;
mod handle;
mod manager;
pub mod mime;
mod resource;
mod source;
pub mod walk;

pub use data::DataSource;
pub use dispatch::DerivedSourceTable;
pub use error::{ModelError, Result};
pub use file::FilesystemSource;
pub use handle::Handle;
pub use manager::{Cookie, ManagerStats, ModelSettings, SourceManager};
pub use resource::{ContentStream, LocalPath, Resource};
pub use source::{HandleIter, Source};
pub use walk::{Visit, Walker};

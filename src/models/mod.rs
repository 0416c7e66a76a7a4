pub mod catalog;
pub mod download;
pub mod manager;
pub mod manifest;

pub use catalog::{Catalog, ModelDescriptor};
pub use download::{format_bytes, DownloadProgress, HttpTransport, ProgressCallback, Transport};
pub use manager::{
    available_space, has_enough_space, ModelManager, ModelManagerConfig, ModelPin, ModelStatus,
};
pub use manifest::{InstalledModel, Manifest};

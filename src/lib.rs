pub mod attributes;
pub mod config;
pub mod deletions;
pub mod file_ops;
pub mod location;
pub mod metrics_store;
pub mod quota;
pub mod store;


pub use attributes::BlobAttributes;
pub use config::{ApplicationDirectories, BlobStoreConfig};
pub use file_ops::{FileOperations, LocalFileOperations};
pub use store::{Blob, FileBlobStore, StoreState};

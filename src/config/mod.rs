//! Configuration loading and the site registry.
//!
//! Settings are YAML; the site registry lives on a metadata record under
//! the state root.

mod error;
mod settings;
mod sites;

pub use error::ConfigError;
pub use settings::{DEFAULT_IMAGE, Layout, Settings};
pub use sites::{BackendKind, DEFAULT_EOS_MOUNT_POINT, Site, SiteRegistry};

//! Third-party library resolution and loading.
//!
//! [`Registry`] answers npm metadata queries, [`DependencyLoader`] fetches,
//! verifies and injects scripts into a [`ScriptTarget`], and
//! [`DependencyManager`] records what each plugin loaded so
//! [`UpdateChecker`] can look for newer versions.

mod loader;
mod manager;
mod registry;
mod updates;

pub use loader::{
    element_id, DependencyInfo, DependencyLoader, DependencyResolution, ScriptTarget,
};
pub use manager::DependencyManager;
pub use registry::{PackageMetadata, Registry};
pub use updates::{AvailableUpdate, UpdateChecker};

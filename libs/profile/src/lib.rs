//! Profile configuration for lokube.
//!
//! A profile is the persisted desired state of one local cluster: the VM
//! parameters ([`MachineConfig`]) and the cluster parameters
//! ([`KubernetesConfig`]), stored together as a [`ProfileDocument`].
//!
//! ## Modules
//!
//! - `model`: configuration value objects and their invariants
//! - `disk`: human-readable disk size parsing
//! - `store`: atomic load/save of the profile document

mod disk;
mod error;
mod model;
mod store;

pub use disk::{parse_disk_size_mb, MINIMUM_DISK_SIZE_MB};
pub use error::{ConfigError, ProfileError};
pub use model::{
    DriverNetwork, ExtraOption, KubernetesConfig, MachineConfig, ProfileDocument, DRIVER_KVM2,
    DRIVER_NONE, EXTRA_OPTION_COMPONENTS,
};
pub use store::{to_json, ProfileStore, PROFILES_DIR, PROFILE_FILE};

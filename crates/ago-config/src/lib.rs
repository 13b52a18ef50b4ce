//! Layered configuration: defaults <- global `$AGO_HOME/config.yaml`
//! <- per-working-directory `<cwd>/.ago/config.yaml`.
//!
//! Merge rule: scalars overwrite, mappings deep-merge, sequences fully
//! replace. `${NAME}` environment references are expanded on string
//! leaves after parsing; unknown names expand to the empty string.

mod store;

pub use store::{ConfigScope, ConfigStore, RegistryEntry, RegistryKind, WorkerLimits};

mod resource;
mod synced_variables;
mod value;

pub use resource::{ResourceError, SyncedResource};
pub use synced_variables::{FullSyncProgress, SyncedVariables};
pub use value::{NamedVariable, SyncedValue, VariableValue};

/// A named blob replicated alongside the synced variables. Registered by
/// weak reference, so dropping the owner unregisters it.
pub trait SyncedResource: Send + Sync {
    fn name(&self) -> &str;

    fn serialize(&self) -> Vec<u8>;

    fn update_from_bytes(&self, data: &[u8]) -> Result<(), ResourceError>;
}

#[derive(Debug, thiserror::Error)]
#[error("resource {name} rejected update: {reason}")]
pub struct ResourceError {
    pub name: String,
    pub reason: String,
}

impl ResourceError {
    pub fn new(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

//! Remote editor sessions, one per client thread.

mod registry;

pub use registry::SessionRegistry;

/// Opaque identifier of the client thread that owns a session, assigned by
/// the network layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

/// A hosted plug-in instance. Shared with the audio pipeline; no session
/// owns it.
pub trait PluginProcessor: Send + Sync {
    fn name(&self) -> &str;

    fn has_editor(&self) -> bool {
        true
    }
}

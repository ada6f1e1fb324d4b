use supervisor_core::model::Command;
use supervisor_core::StateError;

/// The dispatcher's only view of the Hub. Kept as a small trait so the
/// cyclic Hub/Dispatcher reference resolves to an interface instead of a
/// concrete type. The Hub supplies this; tests can supply a trivial double
/// instead.
pub trait Transport: Send + Sync {
    fn send(&self, node_id: &str, command: &Command) -> Result<(), StateError>;
}

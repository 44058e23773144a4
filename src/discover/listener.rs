use crate::model::Kv;

/// Capability a registry fan-out target must implement: add and delete
/// notifications for keys under a monitored prefix.
///
/// Implementors must not call back into the `Registry` they are registered
/// with from inside these methods — the registry invokes listeners outside
/// its lock, but re-entrant `Monitor` calls are still unsupported.
pub trait UpdateListener: Send + Sync {
    fn on_add(&self, kv: Kv);
    fn on_delete(&self, kv: Kv);
}

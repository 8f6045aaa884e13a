use super::{LocalTransport, Transport};
use crate::error::{FanoutError, FanoutResult};
use crate::target::TransportKind;
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

type Factory = Box<dyn Fn() -> Arc<dyn Transport> + Send + Sync>;

struct Slot {
    factory: Factory,
    instance: OnceCell<Arc<dyn Transport>>,
}

/// Transports keyed by kind, each built on first use
#[derive(Default)]
pub struct TransportRegistry {
    slots: HashMap<TransportKind, Slot>,
}

impl fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl TransportRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the transports built into this crate
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(TransportKind::Local, || Arc::new(LocalTransport::new()));
        registry
    }

    /// Register a constructor for a kind, replacing any previous one
    pub fn register<F>(&mut self, kind: TransportKind, factory: F)
    where
        F: Fn() -> Arc<dyn Transport> + Send + Sync + 'static,
    {
        debug!("Registering transport {}", kind);
        self.slots.insert(
            kind,
            Slot {
                factory: Box::new(factory),
                instance: OnceCell::new(),
            },
        );
    }

    /// Register an already built transport for a kind
    pub fn register_instance(&mut self, kind: TransportKind, transport: Arc<dyn Transport>) {
        self.register(kind, move || Arc::clone(&transport));
    }

    /// Transport for a kind, constructing it on first use
    ///
    /// # Errors
    ///
    /// Returns an error if no transport is registered for the kind
    pub fn get(&self, kind: TransportKind) -> FanoutResult<Arc<dyn Transport>> {
        let slot = self
            .slots
            .get(&kind)
            .ok_or_else(|| FanoutError::UnknownTransport(kind.to_string()))?;
        Ok(Arc::clone(slot.instance.get_or_init(|| (slot.factory)())))
    }

    #[must_use]
    pub fn contains(&self, kind: TransportKind) -> bool {
        self.slots.contains_key(&kind)
    }

    /// Registered kinds in a stable order
    #[must_use]
    pub fn kinds(&self) -> Vec<TransportKind> {
        TransportKind::ALL
            .into_iter()
            .filter(|kind| self.contains(*kind))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_defaults_have_local_only() {
        let registry = TransportRegistry::with_defaults();
        assert_eq!(registry.kinds(), vec![TransportKind::Local]);
        assert!(registry.get(TransportKind::Local).is_ok());
    }

    #[test]
    fn test_unknown_kind() {
        let registry = TransportRegistry::with_defaults();
        let err = registry.get(TransportKind::Winrm).err().unwrap();
        assert_eq!(err.to_string(), "No transport registered for 'winrm'");
        assert_eq!(err.kind(), crate::error::UNKNOWN_TRANSPORT);
    }

    #[test]
    fn test_factory_runs_once() {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&built);
        let mut registry = TransportRegistry::new();
        registry.register(TransportKind::Ssh, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Arc::new(MockTransport::new())
        });

        assert_eq!(built.load(Ordering::SeqCst), 0);
        let first = registry.get(TransportKind::Ssh).unwrap();
        let second = registry.get(TransportKind::Ssh).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }
}

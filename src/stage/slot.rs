use std::sync::{Mutex, OnceLock};

use anyhow::{anyhow, Result};

type Loader<T> = Box<dyn Fn() -> Result<Box<T>> + Send + Sync>;

/// Init-once holder for a stage backend and its loaded model.
///
/// A lazy slot runs its loader on first use, which `StageSet::warm_up` forces.
/// The outcome is kept for the life of the slot: a failed load is not retried
/// and every later call reports the same error.
pub struct ModelSlot<T: ?Sized> {
    loader: Option<Loader<T>>,
    cell: OnceLock<std::result::Result<Mutex<Box<T>>, String>>,
}

impl<T: ?Sized + Send> ModelSlot<T> {
    /// Slot around an already constructed backend.
    pub fn ready(backend: Box<T>) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(Ok(Mutex::new(backend)));
        Self { loader: None, cell }
    }

    /// Slot whose backend is built on first use.
    pub fn lazy<F>(loader: F) -> Self
    where
        F: Fn() -> Result<Box<T>> + Send + Sync + 'static,
    {
        Self {
            loader: Some(Box::new(loader)),
            cell: OnceLock::new(),
        }
    }

    fn load(&self) -> Result<&Mutex<Box<T>>> {
        let loaded = self.cell.get_or_init(|| match &self.loader {
            Some(loader) => loader().map(Mutex::new).map_err(|e| format!("{e:#}")),
            None => Err("no backend configured".to_string()),
        });
        loaded
            .as_ref()
            .map_err(|msg| anyhow!("model failed to load: {}", msg))
    }

    /// Run `f` against the backend, loading it first if needed.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> Result<R>) -> Result<R> {
        let slot = self.load()?;
        let mut guard = slot.lock().map_err(|_| anyhow!("backend lock poisoned"))?;
        f(&mut **guard)
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.cell.get(), Some(Ok(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    trait Counter: Send {
        fn bump(&mut self) -> u32;
    }

    struct Simple(u32);

    impl Counter for Simple {
        fn bump(&mut self) -> u32 {
            self.0 += 1;
            self.0
        }
    }

    #[test]
    fn lazy_slot_loads_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let seen = loads.clone();
        let slot: ModelSlot<dyn Counter> = ModelSlot::lazy(move || {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Simple(0)) as Box<dyn Counter>)
        });
        assert!(!slot.is_loaded());
        assert_eq!(slot.with(|c| Ok(c.bump())).unwrap(), 1);
        assert_eq!(slot.with(|c| Ok(c.bump())).unwrap(), 2);
        assert!(slot.is_loaded());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_load_is_sticky() {
        let loads = Arc::new(AtomicUsize::new(0));
        let seen = loads.clone();
        let slot: ModelSlot<dyn Counter> = ModelSlot::lazy(move || {
            seen.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("weights missing"))
        });
        for _ in 0..3 {
            let err = slot.with(|c| Ok(c.bump())).unwrap_err();
            assert!(err.to_string().contains("weights missing"));
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(!slot.is_loaded());
    }

    #[test]
    fn ready_slot_is_loaded() {
        let slot: ModelSlot<dyn Counter> = ModelSlot::ready(Box::new(Simple(41)) as Box<dyn Counter>);
        assert!(slot.is_loaded());
        assert_eq!(slot.with(|c| Ok(c.bump())).unwrap(), 42);
    }
}

//! Keyed mutex registry for the mutual-exclusion scopes.
//!
//! One lock per scope key, created on first use and never removed.
//! Operations inside the same scope for the same key never run concurrently;
//! different keys proceed independently.

use ferrite_core::ids::{JobIdentifier, PipelineName, StageIdentifier};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;

#[derive(Default)]
pub struct MutexRegistry {
    inner: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MutexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_key(&self, key: &str) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Guards staging/promotion of build causes and the pause toggle.
    pub fn for_pipeline(&self, name: &PipelineName) -> Arc<Mutex<()>> {
        self.for_key(&format!(
            "pipeline/{}",
            name.as_str().to_ascii_lowercase()
        ))
    }

    /// Guards cancellation, job-status updates and the completion cascade
    /// for one exact stage instance.
    pub fn for_stage_instance(&self, identifier: &StageIdentifier) -> Arc<Mutex<()>> {
        self.for_key(&format!(
            "stage/{}",
            identifier.stage_locator().to_ascii_lowercase()
        ))
    }

    /// Guards reschedule-vs-update races for one job. Nested inside the
    /// stage-instance scope.
    pub fn for_job(&self, identifier: &JobIdentifier) -> Arc<Mutex<()>> {
        self.for_key(&format!(
            "job/{}",
            identifier.build_locator().to_ascii_lowercase()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_key_returns_same_mutex() {
        let registry = MutexRegistry::new();
        let a = registry.for_pipeline(&PipelineName::new("app"));
        let b = registry.for_pipeline(&PipelineName::new("APP"));
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_different_keys_are_independent() {
        let registry = MutexRegistry::new();
        let a = registry.for_pipeline(&PipelineName::new("app"));
        let b = registry.for_pipeline(&PipelineName::new("other"));
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_scope_serializes_access() {
        let registry = Arc::new(MutexRegistry::new());
        let name = PipelineName::new("app");
        let counter = Arc::new(StdMutex::new(0u32));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let name = name.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                let lock = registry.for_pipeline(&name);
                let _guard = lock.lock().await;
                let before = *counter.lock().unwrap();
                tokio::task::yield_now().await;
                *counter.lock().unwrap() = before + 1;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*counter.lock().unwrap(), 8);
    }
}

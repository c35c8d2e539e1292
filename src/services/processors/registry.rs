use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::{CropProcessor, Processor, ProcessorError, ResizeProcessor};

/// Name-keyed collection of processors.
///
/// Built once at startup and shared behind an `Arc`. Registrations are
/// permanent for the registry's lifetime.
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: RwLock<HashMap<String, Arc<dyn Processor>>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `crop` and `resize` processors.
    pub fn with_defaults() -> Self {
        let mut processors: HashMap<String, Arc<dyn Processor>> = HashMap::new();
        processors.insert("crop".to_string(), Arc::new(CropProcessor::new()));
        processors.insert("resize".to_string(), Arc::new(ResizeProcessor::new()));
        Self {
            processors: RwLock::new(processors),
        }
    }

    pub fn register(
        &self,
        name: impl Into<String>,
        processor: Arc<dyn Processor>,
    ) -> Result<(), ProcessorError> {
        let name = name.into();
        let mut processors = self.processors.write().unwrap_or_else(|e| e.into_inner());
        if processors.contains_key(&name) {
            return Err(ProcessorError::DuplicateRegistration(name));
        }
        tracing::debug!(processor = %name, "Registered processor");
        processors.insert(name, processor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Processor>, ProcessorError> {
        self.processors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| ProcessorError::NotFound(name.to_string()))
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .processors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

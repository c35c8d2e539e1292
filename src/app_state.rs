use std::sync::Arc;

use crate::services::{
    job_store::JobStore, pipeline::JobSubmitter, processors::ProcessorRegistry,
    queue::JobPublisher,
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub publisher: Arc<dyn JobPublisher>,
    pub registry: Arc<ProcessorRegistry>,
    pub submitter: Arc<JobSubmitter>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn JobStore>,
        publisher: Arc<dyn JobPublisher>,
        registry: Arc<ProcessorRegistry>,
    ) -> Self {
        let submitter = JobSubmitter::new(store.clone(), publisher.clone(), registry.clone());
        Self {
            store,
            publisher,
            registry,
            submitter: Arc::new(submitter),
        }
    }
}

//! Shared state handed to every HTTP handler.

use std::sync::Arc;

use crate::services::{
    dispatch_queue::DispatchQueue, producer::ProducerSet, storage_service::StorageService,
};

#[derive(Clone)]
pub struct AppState {
    pub storage: StorageService,
    /// The single bucket the pipeline reads and writes.
    pub bucket: String,
    pub queue: Arc<DispatchQueue>,
    pub producers: Arc<ProducerSet>,
}

pub mod analysis;
pub mod consumer;
pub mod dead_letter_queue;
pub mod dead_letter_store;
pub mod dispatch_queue;
pub mod notifier;
pub mod producer;
pub mod scheduler;
pub mod storage_service;

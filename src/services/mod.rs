pub mod job_store;
pub mod memory_queue;
pub mod memory_store;
pub mod pipeline;
pub mod processors;
pub mod queue;
pub mod redis_queue;
pub mod storage;

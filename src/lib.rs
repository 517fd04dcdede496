pub mod api;
pub mod blob;
pub mod invoice;
pub mod llm;
pub mod queue;
pub mod security;
pub mod shared;
pub mod storage;

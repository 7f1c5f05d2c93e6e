pub mod artifact_store;
pub mod catalog;
pub mod chunk_store;
pub mod classifier;
pub mod reassembler;
pub mod scanner;
pub mod session;
pub mod worker;

pub mod chunk_store;
pub mod error;
pub mod reassembler;
pub mod session_tracker;
pub mod transcoder;
pub mod upload_service;

#[cfg(test)]
pub mod testing;

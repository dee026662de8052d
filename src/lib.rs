pub mod backend;
pub mod cli;
pub mod error;
pub mod metadata;
pub mod server;
pub mod storage;
pub mod sync;
pub mod transfer;
pub mod types;

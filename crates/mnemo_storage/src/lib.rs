#![forbid(unsafe_code)]

pub mod memory_store;
pub mod repo;

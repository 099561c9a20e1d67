//! Upload pipeline services: staging, reassembly, archiving, pinning and
//! usage accounting.

pub mod archiver;
pub mod asset_locks;
pub mod asset_repository;
pub mod chunk_store;
pub mod pin_worker;
pub mod reassembler;
pub mod remote;
pub mod usage;

//! kneecast: low-latency delivery of rendered overlay frames from one
//! producer process to many consumer processes over shared memory.
//!
//! The protocol is a single fixed-layout metadata record behind a seqlock,
//! plus a two-slot swapchain of shared texture/fence handles. Producers use
//! [`shm::Writer`]; consumers poll [`shm::CachedReader`] with a GPU backend
//! from [`gpu`] and composite the resulting [`shm::Snapshot`].

pub mod config;
pub mod gpu;
pub mod shm;

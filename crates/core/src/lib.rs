//! Domain types shared by the bridge crates.
//!
//! Job descriptors, media artifacts, sampler vocabulary and the workflow
//! graph model. No I/O happens here.

pub mod error;
pub mod hashing;
pub mod job;
pub mod media;
pub mod sampler;
pub mod types;
pub mod workflow;

//! Kiln worker: configuration and the HTTP collaborators (job queue,
//! artifact delivery) the binary wires into the job pipeline.

pub mod config;
pub mod delivery;
pub mod queue_client;

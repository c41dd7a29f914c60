//! Types shared by the Birdlens realtime client and its tooling.

pub mod audio;
pub mod config;
pub mod detection;
pub mod protocol;

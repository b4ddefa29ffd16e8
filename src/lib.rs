//! HLS reverse proxy.
//!
//! Fetches playlists and segments from an origin while presenting a forged
//! browser identity, and rewrites playlists so every sub-playlist, segment
//! and key request comes back through the proxy.

pub mod config;
pub mod error;
pub mod hls;
pub mod metrics;
pub mod relay;
pub mod server;
pub mod upstream;

//! # Open Music Engine
//!
//! Multi-guild playback session engine for a Discord music bot. Each guild
//! with active playback gets its own session actor that resolves tracks,
//! keeps the queue, drives a Lavalink-compatible audio node and enforces the
//! guild's DJ policy.

pub mod audio;
pub mod bot;
pub mod cache;
pub mod config;
pub mod error;
pub mod node;
pub mod sources;
pub mod storage;
pub mod voice;

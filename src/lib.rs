//! stationFlow: core library for the broadcast automation engine.
//!
//! The mixer, fades, playback queues, station IDs and library loudness
//! normalization live here. The `stationflow` CLI consumes this crate.

pub mod backend;
pub mod config;
pub mod effect;
pub mod error;
pub mod ledger;
pub mod library;
pub mod logging;
pub mod media_tool;
pub mod mixer;
pub mod normalize;
pub mod playback;
pub mod queue;
pub mod runtime;
pub mod scheduler;
pub mod sound;
pub mod station;
pub mod timecode;

#[cfg(test)]
mod test_support;

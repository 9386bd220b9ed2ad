//! Scopelog captures two-channel voltage readings streamed as text lines
//! over a serial port and lands them in per-session CSV files, together
//! with the participant and session registries an experiment needs. A
//! serial reader feeds a frame decoder, a watchdog keeps the link honest,
//! a recorder tracks the session lifecycle with pause-aware elapsed time,
//! and a background writer batches records to disk with an fsync on every
//! flush. Finished session files and the registries get timestamped
//! backups.
//!
//! [`pipeline::Pipeline`] assembles all of it behind one handle; the
//! `scopelog` binary drives captures interactively and the `monitor`
//! binary watches a live stream. With `--simulate` everything runs against
//! the built-in signal source in [`sim`] instead of hardware.

#![warn(missing_docs)]
pub mod args;
pub mod backup;
pub mod buffer;
pub mod config;
pub mod events;
pub mod frame;
pub mod gui;
pub mod link;
pub mod pipeline;
pub mod session;
pub mod sim;
pub mod stats;
pub mod storage;
pub mod watchdog;

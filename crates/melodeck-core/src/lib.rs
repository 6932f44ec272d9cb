//! MeloDeck Core - Domain logic and business rules for library synchronization
//!
//! This crate contains the hexagonal architecture core with:
//! - **Domain entities** - `LibraryEntry`, `Snapshot`, `Baseline`, `ChangeSet`,
//!   `ExecutionReport`, `RunSummary`
//! - **Run model** - the run-level state machine and the `RunContext` passed
//!   through every scan/diff/execute call
//! - **Port definitions** - Traits for adapters: `StateStore`, `Fingerprinter`,
//!   `MetadataExtractor`
//!
//! # Architecture
//!
//! This crate follows the hexagonal (ports & adapters) architecture pattern.
//! The domain module contains pure business logic with no filesystem or
//! database access. Ports define trait interfaces that adapter crates
//! (`melodeck-scan`, `melodeck-diff`, `melodeck-store`) implement. The
//! `melodeck-sync` crate orchestrates domain entities through the ports.

pub mod config;
pub mod domain;
pub mod ports;

#![doc = "tree-mirror-core: core logic library for tree-mirror."]

//! This crate turns a flat repository listing into chat destinations and
//! message-sized markdown chunks. It contains no network code: fetching the
//! tree, resolving channels/threads and posting messages are collaborator
//! traits (see [`contract`]) implemented by the binary crate.
//!
//! # Usage
//! Call [`mirror::run_mirror`] with a [`config::MirrorConfig`] and the three
//! collaborators, or [`mirror::mirror_entries`] with an already fetched listing.

pub mod config;
pub mod contract;
pub mod error;
pub mod mirror;
pub mod partition;
pub mod render;
pub mod split;
pub mod tree;

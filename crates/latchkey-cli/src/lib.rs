#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::redundant_pub_crate)]

//! Offline tooling for latchkey configuration trees.
//!
//! Validates source files, lists their keys, seals secure values with a
//! master key and prints default sources, all without a running registry.

pub(crate) mod cli;
pub(crate) mod commands;
pub(crate) mod error;
pub(crate) mod output;

pub use cli::run;

//! A WebAssembly MVP interpreter.
//!
//! Binaries are decoded with [`fmt::binary`], checked by [`validation`], and
//! instantiated and executed inside an [`exec::Store`]. The [`embed`] module
//! wraps those steps in a flat API with a single error type.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unused_lifetimes,
    unused_qualifications
)]

pub mod config;
pub mod dump;
pub mod embed;
pub mod exec;
pub mod fmt;
pub mod module;
pub mod validation;

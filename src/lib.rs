//! Purpose: Record-oriented trunked storage for versioned append-only datasets.
//! Exports: `core` (streams, record stores, views, shuffles, sharing), `backend`
//! (local disk and HTTP range-read storage), `api` (dataset resolution surface).
//! Role: Library crate; storage backends plug in behind `core::backend` traits.
//! Invariants: Datasets are append-only; readers never coordinate with writers.
//! Invariants: End-of-stream is a value (`Ok(None)`), never an error kind.
pub mod api;
pub mod backend;
pub mod core;

// Core modules implementing trunked streams, record storage, and sharing.
pub mod backend;
pub mod error;
pub mod manifest;
pub mod record;
pub mod share;
pub mod shuffle;
pub mod source;
pub mod trunk;
pub mod view;

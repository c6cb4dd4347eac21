// Storage backend implementations plugging into `core::backend`.
mod http;
mod local;

pub use http::HttpBackend;
pub use local::DiskBackend;

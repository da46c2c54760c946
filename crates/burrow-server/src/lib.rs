pub mod dispatch;
pub mod fetch;
pub mod server;
pub mod session;
pub mod tracker;

pub use fetch::{FetchError, FetchRequest, FetchResponse, HttpFetcher, ResourceFetcher};
pub use server::{start, AppState, ServerConfig, ServerHandle, StartError, SUPPORTED_VERSIONS};

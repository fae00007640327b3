//! Front door: path normalization, the redirect policy and the HTTP server.

pub mod redirect;
pub mod server;

pub use redirect::{is_redirectable, normalize_path, RedirectConfig, RedirectDecision, RedirectPolicy};
pub use server::{ProxyServer, ServerConfig, INVALID_PATH_CACHE_CONTROL};

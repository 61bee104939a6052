//! HTTP and WebSocket surface of the backend.

pub mod extract;
pub mod hooks;
pub mod routes;
pub mod seed;
pub mod state;
pub mod ws;

pub use routes::router;
pub use state::{AppState, StateBuilder};

//! API server and routes

pub mod middleware;
pub mod rate_limit;
pub mod routes;
pub mod server;
pub mod types;

pub use server::ApiServer;

mod api;
mod app;
mod core;
mod streams;
mod subscriptions;
mod utils;

use crate::core::CoreApp;

#[tokio::main]
async fn main() {
    if let Err(e) = CoreApp::run().await {
        eprintln!("\nError: {}\n", e);
        std::process::exit(1);
    }
}

//! BFF edge server: a fixed set of JSON endpoints served by the event-driven
//! engine in the `bff` crate.
//!
//! ```bash
//! RUST_LOG=info cargo run -p bff-server --release
//! curl -i http://127.0.0.1:8080/health
//! ```

use bff::{init_logging, Config, Router, Server};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let config = Config::from_env()?;

    let mut router = Router::new();
    router.add("/bonuses", br#"{"bonuses":[10,20,30]}"#);
    router.add("/settings", br#"{"settings":{"theme":"dark"}}"#);
    router.add("/games", br#"{"games":["chess","poker"]}"#);
    router.add("/health", br#"{"status":"OK"}"#);

    Server::from_config(&config).serve(router)?;
    Ok(())
}

//! Minimal fluxhttp server.
//!
//! ```text
//! RUST_LOG=fluxhttp=debug cargo run --example hello_world
//! curl -i http://127.0.0.1:8080/hello
//! curl -i http://127.0.0.1:8080/boom     # 500 from a failing handler
//! ```

use fluxhttp::{AppError, Server, ServerConfig, StatusCode, TcpReactor, app_fn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fluxhttp=info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => ServerConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => ServerConfig::default(),
    };

    let server = Server::new(config, TcpReactor::new());
    server.start(app_fn(|env| {
        Box::pin(async move {
            let path = env.path().unwrap_or("/").to_owned();
            if path == "/boom" {
                return Err(AppError::new("boom"));
            }

            let method = env.method().map(ToString::to_string).unwrap_or_default();
            env.set_status(StatusCode::Ok);
            env.response_headers_mut()
                .insert("Content-Type", "text/plain; charset=utf-8");
            env.set_body(format!("Hello, World! ({method} {path})\n"));
            Ok(())
        })
    }))?;

    let address = server.local_addr().unwrap_or(server.config().address);
    println!("Listening on http://{address}");
    server.wait()?;
    Ok(())
}

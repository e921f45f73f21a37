//! Relay chat daemon. Exits 0 on a clean SIGTERM/SIGINT shutdown, 1 on a
//! configuration or startup failure.

#[tokio::main]
async fn main() {
    if let Err(err) = relay_chatd::run().await {
        eprintln!("chatd failed to start: {err:#}");
        std::process::exit(1);
    }
}

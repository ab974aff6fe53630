#[tokio::main]
async fn main() {
    if let Err(e) = server::start_server().await {
        eprintln!("pulse failed: {e}");
        std::process::exit(1);
    }
}

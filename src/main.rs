#[tokio::main]
async fn main() {
    if let Err(err) = chat_handover::run().await {
        tracing::error!(error = %err, "chat-handover stopped");
        eprintln!("chat-handover: {err}");
        std::process::exit(1);
    }
}

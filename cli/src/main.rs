use anyhow::Result;

async fn run() -> Result<()> {
    sandpak_utils::initialize_tracing();
    tracing::trace!("starting");
    sandpak_lib::cli::run_from_iter(std::env::args()).await
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(e) = run().await {
        // Single line, kind-preserving context chain
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

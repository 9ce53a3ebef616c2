use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cmd;
use cmd::MainCmd;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = MainCmd::parse().run().await {
        if e.is_silent() {
            tracing::info!("{}", e.user_message());
            return;
        }
        tracing::error!(error = %e, "command failed");
        eprintln!("{}", e.user_message());
        std::process::exit(1);
    }
}

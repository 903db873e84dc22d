use clap::Parser;
use tracing_subscriber::EnvFilter;

use rye_cli::Cli;
use rye_cli::run;

#[tokio::main]
async fn main() {
    let default_filter = if rye_core::flags::debug_enabled() {
        "rye=debug"
    } else {
        "rye=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(result) => {
            // Structured output is the contract: one JSON document on stdout.
            match serde_json::to_string_pretty(&result) {
                Ok(json) => println!("{json}"),
                Err(e) => {
                    eprintln!("error: failed to serialize result: {e}");
                    std::process::exit(1);
                }
            }
        }
        Err(e) => {
            let error = serde_json::json!({
                "status": "error",
                "error": e.to_string(),
            });
            println!("{error}");
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}

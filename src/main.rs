use std::env;

use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let mut args = env::args().skip(1);
    let cmd = args.next().unwrap_or_default();
    if cmd != "serve" {
        eprintln!("Usage: prospector serve --config <path>");
        std::process::exit(2);
    }

    let mut config_path = String::from("./config/example-config.yaml");
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(v) = args.next() {
                config_path = v;
            }
        }
    }

    let cfg = match prospector_config::load_and_validate(&config_path) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.logging.filter.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    tracing::info!(config = %config_path, store = %cfg.store.kind, "starting prospector");

    if let Err(e) = prospector_server::serve(cfg).await {
        tracing::error!(error = %e, "server exited with error");
        std::process::exit(1);
    }
}

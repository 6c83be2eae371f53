use std::env;

mod demo;
mod telemetry;

#[tokio::main]
async fn main() {
    let mut args = env::args().skip(1);
    let cmd = args.next().unwrap_or_default();
    if cmd != "serve" {
        eprintln!("Usage: slackbot serve --config <path>");
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

    let cfg = match slackbot_config::load_and_validate(&config_path) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            std::process::exit(1);
        }
    };
    telemetry::init(&cfg.logging);
    tracing::info!(config = %config_path, store = %cfg.store.kind, "config loaded");

    if let Err(e) = slackbot_server::serve(cfg, demo::bot()).await {
        tracing::error!(error = %e, "server exited with error");
        std::process::exit(1);
    }
}

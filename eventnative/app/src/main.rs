mod app;
mod config;

use std::env;
use std::process;
use tracing::error;

#[tokio::main]
async fn main() {
    // Install global log collector.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match env::var("CONFIG_PATH") {
        Ok(path) => config::AppConfig::from_path(path).unwrap_or_else(|err| {
            error!("{:?}", err);
            process::exit(1);
        }),
        Err(_) => {
            error!("env variable CONFIG_PATH should be set");
            process::exit(1);
        }
    };

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    app::App { config }
        .run(stdin, tokio::io::stdout())
        .await
        .unwrap_or_else(|err| {
            error!("{:?}", err);
            process::exit(1);
        });
}

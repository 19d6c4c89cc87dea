use manta_relay::http::{router, AppState};
use manta_relay::RelayConfig;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let path = args
        .next()
        .ok_or("usage: manta-gateway <config.json> [--listen HOST:PORT]")?;

    let mut listen_override: Option<String> = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" | "--addr" => {
                listen_override = Some(args.next().ok_or("missing value for --listen/--addr")?);
            }
            other => return Err(format!("unknown arg: {other}").into()),
        }
    }

    let raw = std::fs::read_to_string(&path)?;
    let config = RelayConfig::from_json(&raw)?;
    let listen = listen_override.unwrap_or_else(|| config.listen.clone());

    let app = router(AppState::from_config(config));
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(%listen, "manta-gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}

use std::error::Error;
use std::time::Duration;

use feedwire::stream::{StreamClient, StreamConfig};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const TICKER: &str = "market_BTCUSDT_ticker";
const KLINE: &str = "market_BTCUSDT_kline_1min";
const RUN_FOR: Duration = Duration::from_secs(30);

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let endpoint = std::env::var("FEEDWIRE_WS_URL")
        .map_err(|_| "set FEEDWIRE_WS_URL to the exchange websocket endpoint")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let (client, task) = StreamClient::spawn(StreamConfig::new(endpoint))?;

        // Replayed on every (re)connect.
        client.subscribe(TICKER);
        client.subscribe(KLINE);
        client.on_open(|| println!("connected"));
        client.on_message(|message: &Value| println!("{message}"));
        client.on_error(|err| eprintln!("stream error: {err}"));
        client.on_close(|| println!("disconnected"));
        client.connect();

        tokio::time::sleep(RUN_FOR).await;
        client.close();
        task.await?;

        Ok::<(), Box<dyn Error>>(())
    })
}

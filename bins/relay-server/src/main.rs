use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use codec_json::JsonSerializer;
use relay_engine::{handler, App, RelayConfig, StreamHandle, StreamOptions, Topic};
use transport_memory::MemoryTransport;

#[derive(Parser)]
#[command(name = "relay-server", about = "Topic fan-out relay over an in-memory log")]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(long, default_value = "relay.toml", env = "RELAY_CONFIG")]
    config: String,
}

/// Parse a `topic<TAB>key<TAB>value` line. An empty key means no key.
fn parse_line(line: &str) -> Option<(&str, Option<Vec<u8>>, Option<Vec<u8>>)> {
    let mut parts = line.splitn(3, '\t');
    let topic = parts.next().filter(|t| !t.is_empty())?;
    let key = parts
        .next()
        .filter(|k| !k.is_empty())
        .map(|k| k.as_bytes().to_vec());
    let value = parts.next().map(|v| v.as_bytes().to_vec());
    Some((topic, key, value))
}

fn logging_stream(name: String, topic: &Topic) -> Option<StreamHandle> {
    let label: Arc<str> = Arc::from(name.as_str());
    let result = topic.stream(
        handler(move |event| {
            let label = label.clone();
            async move {
                match &event.message {
                    Some(m) => tracing::info!(
                        stream = %label,
                        topic = %m.topic,
                        partition = m.partition,
                        offset = m.offset,
                        key = ?event.key,
                        value = ?event.value,
                        "event"
                    ),
                    None => tracing::info!(stream = %label, value = ?event.value, "local event"),
                }
                Ok(())
            }
        }),
        StreamOptions::named(name.clone()),
    );
    match result {
        Ok(stream) => Some(stream),
        Err(e) => {
            tracing::error!(stream = %name, error = %e, "failed to create stream");
            None
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    tracing::info!(config = %cli.config, "loading configuration");
    let config = match RelayConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let transport = MemoryTransport::with_partitions(config.transport.partitions);
    let app = App::from_config(&config, Arc::new(JsonSerializer), Arc::new(transport.clone()));

    let descriptors = match config.descriptors(&app) {
        Ok(d) => d,
        Err(e) => {
            tracing::error!(error = %e, "invalid stream configuration");
            std::process::exit(1);
        }
    };
    let streams: Vec<StreamHandle> = descriptors
        .into_iter()
        .filter_map(|(name, topic)| logging_stream(name, &topic))
        .collect();

    tracing::info!(app = %app.id(), streams = streams.len(), "starting relay");
    if let Err(e) = app.start() {
        tracing::error!(error = %e, "failed to start");
        std::process::exit(1);
    }

    let sources = app.sources().clone();
    tokio::spawn(async move {
        match sources.wait_running().await {
            Ok(()) => tracing::info!(pattern = %sources.pattern(), "relay running"),
            Err(e) => tracing::error!(error = %e, "relay failed to start"),
        }
    });

    let producer = transport.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match parse_line(&line) {
                    Some((topic, key, value)) => {
                        let (tp, offset) = producer.produce(topic, key, value);
                        tracing::debug!(%tp, offset, "produced from stdin");
                    }
                    None => tracing::warn!(%line, "expected topic<TAB>key<TAB>value"),
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "failed to read stdin");
                    break;
                }
            }
        }
    });

    tracing::info!("relay-server started, press Ctrl+C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
    }
    tracing::info!("shutting down...");

    for stream in streams {
        stream.stop().await;
    }
    if let Err(e) = app.stop().await {
        tracing::error!(error = %e, "shutdown failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        let (topic, key, value) = parse_line("orders\tk1\t{\"id\":1}").unwrap();
        assert_eq!(topic, "orders");
        assert_eq!(key.as_deref(), Some(&b"k1"[..]));
        assert_eq!(value.as_deref(), Some(&b"{\"id\":1}"[..]));
    }

    #[test]
    fn test_parse_line_without_key() {
        let (topic, key, value) = parse_line("orders\t\tv").unwrap();
        assert_eq!(topic, "orders");
        assert!(key.is_none());
        assert_eq!(value.as_deref(), Some(&b"v"[..]));
    }

    #[test]
    fn test_parse_line_rejects_empty_topic() {
        assert!(parse_line("\tk\tv").is_none());
        assert!(parse_line("").is_none());
    }
}

//! trtllm-generate
//!
//! Streams a completion for the prompt given on the command line to stdout.
//! Configuration comes from the YAML file named by `TRTLLM_CONFIG`, or from
//! `TRTLLM_*` environment variables when it is unset.

use std::io::Write;
use trtllm_client::{Client, StreamOptions};
use trtllm_common::{ClientConfig, Result, TrtLlmError};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = match std::env::var("TRTLLM_CONFIG") {
        Ok(path) => ClientConfig::from_file(path)?,
        Err(_) => ClientConfig::from_env()?,
    };

    // Initialize logging
    let default_filter = config
        .observability
        .as_ref()
        .map(|o| format!("trtllm_client={},trtllm_generate={}", o.log_level, o.log_level))
        .unwrap_or_else(|| "trtllm_client=info,trtllm_generate=info".to_string());
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let prompt = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if prompt.trim().is_empty() {
        return Err(TrtLlmError::invalid_input("usage: trtllm-generate <prompt>"));
    }

    info!(
        "Connecting to {} ({:?} transport), model {}",
        config.server_url, config.transport, config.model_name
    );
    let model = config.model_name.clone();
    let client = Client::connect(config).await?;

    if !client.supports_streaming() {
        let text = client.request(&model, &prompt, &Default::default()).await?;
        println!("{}", text);
        return Ok(());
    }

    let mut stream = client.stream(&model, &prompt, StreamOptions::default()).await?;
    let mut stdout = std::io::stdout();

    let interrupted = loop {
        let chunk = tokio::select! {
            _ = tokio::signal::ctrl_c() => None,
            chunk = stream.next_chunk() => Some(chunk),
        };

        match chunk {
            None => break true,
            Some(Ok(Some(text))) => {
                stdout.write_all(text.as_bytes())?;
                stdout.flush()?;
            }
            Some(Ok(None)) => break false,
            Some(Err(e)) => {
                error!("Generation failed: {}", e);
                return Err(e);
            }
        }
    };

    if interrupted {
        info!("Interrupted, stopping request {}", stream.request_id());
        stream.cancel()?;
    }

    writeln!(stdout)?;
    Ok(())
}

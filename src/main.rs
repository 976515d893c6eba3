use std::io::Read;
use std::sync::Arc;
use anyhow::{Result, Context};

// Custom modules
use junkvision::utils::config::AppConfig;
use junkvision::adapters;
use junkvision::pipeline::{Pipeline, QuoteRequest};

/// Reads a quote request from the path given as the first argument, or
/// from stdin when no path is given, and prints the quote response.
#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let local_env = args.iter().any(|a| a == "--local");

    // Initialize config
    let app_config = AppConfig::new(local_env)
        .context("Error loading config")?;

    // Initiate model adapters
    adapters::init_model_adapters(&app_config)
        .context("Error initiating model adapters")?;
    let model_adapters = adapters::get_model_adapters()
        .context("Error getting model adapters")?;

    // Read request payload
    let request_json = match args.iter().skip(1).find(|a| !a.starts_with("--")) {
        Some(path) => std::fs::read_to_string(path)
            .context("Error reading request file")?,
        None => {
            let mut buffer = String::new();
            std::io::stdin().read_to_string(&mut buffer)
                .context("Error reading request from stdin")?;
            buffer
        }
    };

    let request: QuoteRequest = serde_json::from_str(&request_json)
        .context("Error parsing quote request")?;

    // Run the pipeline
    let pipeline = Pipeline::new(&app_config, Arc::clone(model_adapters));
    let response = pipeline.run_quote(request).await
        .context("Pipeline invariant violation")?;

    println!("{}", serde_json::to_string_pretty(&response)?);

    Ok(())
}

use lancet_runner::{Runner, RunnerConfig};
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;

/// Usage: fetch_once <url-template> [FUZZ-value]
///
/// Loads extra settings from LANCET_CONFIG (a JSON file) when set.
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let url = args.next().unwrap_or_else(|| "https://example.com/FUZZ".to_string());
    let value = args.next().unwrap_or_else(|| "index.html".to_string());

    let mut config = match std::env::var("LANCET_CONFIG") {
        Ok(path) => RunnerConfig::from_json(&std::fs::read_to_string(path)?)?,
        Err(_) => RunnerConfig::default(),
    };
    config.url = url;

    let runner = Runner::new(Arc::new(config), false);

    let mut input = HashMap::new();
    input.insert("FUZZ".to_string(), value.into_bytes());

    let mut request = runner.prepare(&input)?;
    println!("{} {}", request.method, request.url);

    let response = runner.execute(&mut request).await?;

    println!("\nStatus: {}", response.status_code);
    println!(
        "Size: {}  Words: {}  Lines: {}  Time: {:?}",
        response.content_length, response.content_words, response.content_lines, response.time
    );
    if response.cancelled {
        println!("Body skipped");
    }
    if response.is_redirection() {
        println!("Redirects to: {}", response.redirect_location(true));
    }

    Ok(())
}

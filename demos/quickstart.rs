use anyhow::Result;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vision_pilot::agent::{ChromiumDevice, DiskScreenshotSink};
use vision_pilot::{Agent, AgentConfig, BrowserConfig, LlmClient, LlmConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let device = match std::env::var("CHROME_WS_URL") {
        Ok(ws) if !ws.trim().is_empty() => ChromiumDevice::connect(&ws).await?,
        _ => ChromiumDevice::launch(BrowserConfig { headless: false, ..Default::default() }).await?,
    };
    let device = Arc::new(device);
    let llm = LlmClient::new(LlmConfig::default())?;

    let runs_dir = std::env::temp_dir().join("vision_pilot_runs");
    let agent = Agent::new(device.clone(), device.clone(), llm, AgentConfig::default())
        .with_screenshot_sink(Arc::new(DiskScreenshotSink::new(&runs_dir)));

    let instruction = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "Open https://example.com and tell me the page heading".to_string());
    let report = agent.run(&instruction).await?;

    info!(url = %device.browser().url().await.unwrap_or_default(), "final page");
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

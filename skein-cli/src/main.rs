//! Reference orchestrator: wires the execution core to a scripted provider
//! and prints the unified event stream as JSON lines.
//!
//! Configuration is environment-driven (`SKEIN_PROVIDER`, `SKEIN_MODEL`,
//! `SKEIN_MAX_STEPS`, `SKEIN_TIMEOUT_SECS`, `SKEIN_LOG`, `SKEIN_PORT`);
//! the process exits 0 on clean shutdown and non-zero on configuration
//! errors. Real provider clients and HTTP transports plug in at the
//! [`skein::provider::ChatProvider`] and event-stream seams.

#![allow(clippy::print_stdout)]

mod config;

use std::process::ExitCode;
use std::sync::Arc;

use serde_json::json;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use skein::prelude::*;

use config::Config;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("skein: {err}");
            return ExitCode::from(2);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log.clone()))
        .with_writer(std::io::stderr)
        .init();

    if config.provider != "mock" {
        error!(provider = %config.provider, "only the mock provider ships with the reference binary");
        return ExitCode::from(2);
    }

    info!(model = %config.model, max_steps = config.max_steps, port = config.port, "starting");

    let prompt = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    let prompt = if prompt.is_empty() { "hi".to_owned() } else { prompt };

    match run_demo(&config, prompt).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "run failed");
            ExitCode::FAILURE
        }
    }
}

/// Drive one agent run end-to-end and print every event.
async fn run_demo(config: &Config, prompt: String) -> Result<()> {
    let registry = Arc::new(ToolRegistry::new());
    registry.register_fn(
        ToolSpec::new(
            "get_weather",
            "Returns the weather for a city.",
            json!({
                "type": "object",
                "properties": {"city": {"type": "string"}},
                "required": ["city"]
            }),
        ),
        |_ctx, _args| Box::pin(async { Ok("72F and sunny".to_owned()) }),
    )?;

    let provider = Arc::new(
        MockProvider::new()
            .tool_call("call_1", "get_weather", &json!({"city": "NYC"}))
            .text("It is 72F and sunny in NYC."),
    );
    let agent = Agent::new("reference", provider, registry).with_model(config.model.clone());

    let mut ctx = RunContext::new();
    if let Some(timeout) = config.timeout {
        ctx = ctx.with_timeout(timeout);
    }
    let options = AgentOptions::default().with_max_steps(config.max_steps);

    let mut stream = agent.run_stream(ctx, vec![Message::user(prompt)], options)?;
    while let Some(event) = stream.next().await {
        match serde_json::to_string(&event) {
            Ok(line) => println!("{line}"),
            Err(err) => error!(error = %err, "unserializable event"),
        }
    }
    Ok(())
}

//! Noor kernel daemon - main entry point.
//!
//! Boots the kernel and the cognitive pipeline, wires the pipeline to
//! `input:*` bus events and runs until interrupted. Capability agents are
//! registered by the embedding application; run standalone, every decision
//! degrades to the chat fallback.

use std::sync::Arc;

use noor_core::cognition::CognitiveLoop;
use noor_core::kernel::Kernel;
use noor_core::Config;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration: first CLI argument is an optional JSON config path.
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_json_file(&path)?,
        None => Config::default(),
    };

    // Initialize observability
    noor_core::observability::init_tracing(&config.observability);

    let kernel = Arc::new(Kernel::new(config));
    kernel.start().await?;

    let pipeline = Arc::new(CognitiveLoop::new(Arc::clone(&kernel)));
    pipeline.start_input_pump().await?;

    tracing::info!("noor_kernel_ready");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown_requested");

    pipeline.stop_input_pump().await;
    kernel.stop().await?;

    Ok(())
}

//! nodecmd demo binary
//!
//! Runs one sequential batch against a node:
//!
//! ```text
//! nodecmd <node-name> <node-ip> <kind:id> [<kind:id> ...]
//! nodecmd N1 10.0.0.1 fbc:162 rpc:163 fbc:164
//! ```

use anyhow::{anyhow, Result};
use nodecmd::{
    BatchConfig, CircuitBreaker, CommandAction, EngineEvent, FileLogSink, SequentialBatchProcessor,
    SessionManager, StatusPriority, TelnetSessionFactory, TokenCatalog, TokenKind, TokenRecord,
    TokenRequest,
};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 3 {
        return Err(anyhow!(
            "usage: nodecmd <node-name> <node-ip> <kind:id> [<kind:id> ...]"
        ));
    }
    let node = args[0].clone();
    let node_ip = args[1].clone();

    let mut requests = Vec::new();
    let mut records = Vec::new();
    for spec in &args[2..] {
        let (kind_str, id) = spec
            .split_once(':')
            .ok_or_else(|| anyhow!("bad token spec {:?}, expected kind:id", spec))?;
        let kind = TokenKind::parse(kind_str)
            .ok_or_else(|| anyhow!("unknown token kind {:?}", kind_str))?;
        requests.push(TokenRequest::new(id, kind));
        records.push(TokenRecord {
            token_id: id.to_string(),
            token_kind: kind_str.to_string(),
            ip_address: node_ip.clone(),
            port: None,
            protocol: None,
        });
    }

    let mut catalog = TokenCatalog::new();
    catalog.add_node(&node, &node_ip, &records);

    let sessions = Arc::new(SessionManager::new(Box::new(TelnetSessionFactory::new())));
    let sink = Arc::new(FileLogSink::new("logs"));
    let breaker = Arc::new(CircuitBreaker::default());
    let (processor, mut events) = SequentialBatchProcessor::new(
        sessions.clone(),
        sink,
        breaker,
        BatchConfig::default(),
    );

    info!("Processing {} tokens on {}", requests.len(), node);

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                EngineEvent::Status { text, priority } => match priority {
                    StatusPriority::Info => info!("{}", text),
                    StatusPriority::Warning => warn!("{}", text),
                    StatusPriority::Error => error!("{}", text),
                },
                EngineEvent::Progress { completed, total } => {
                    info!("Progress: {}/{}", completed, total);
                }
                EngineEvent::BatchFinished { success, total } => {
                    info!("Batch finished: {}/{} succeeded", success, total);
                }
            }
        }
    });

    let summary = processor
        .process_tokens(&catalog, &node, requests, CommandAction::Print)
        .await?;

    sessions.close_all().await;
    drop(processor);
    let _ = printer.await;

    for failure in &summary.failures {
        warn!("Failure: {}", failure);
    }
    if !summary.all_succeeded() {
        return Err(anyhow!(
            "batch {}: {}/{} succeeded",
            summary.batch_id,
            summary.success,
            summary.total
        ));
    }
    Ok(())
}

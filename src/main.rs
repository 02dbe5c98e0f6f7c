//! AIOps Operator Entry Point
//!
//! Starts the four controllers, the health probe endpoint and the Rollout
//! admission webhook.

use std::net::SocketAddr;
use std::sync::Arc;

use aiops_operator::analysis::ReadyEngine;
use aiops_operator::controller;
use aiops_operator::llm::OllamaClient;
use aiops_operator::traffic::NginxIngressProvider;
use aiops_operator::webhook::{TlsConfig, WebhookServer};
use aiops_operator::Error;
use axum::routing::get;
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "aiops-operator", about = "AIOps remediation and rollout operator")]
struct Args {
    /// Base URL of the Ollama-compatible chat endpoint
    #[arg(long, env = "OLLAMA_URL", default_value = "http://127.0.0.1:11434")]
    ollama_url: String,

    /// Model used for remediation proposals
    #[arg(long, env = "OLLAMA_MODEL", default_value = "qwen2.5:7b")]
    ollama_model: String,

    /// Bind address for the health probe endpoint
    #[arg(long, default_value = "0.0.0.0:8081")]
    probe_addr: SocketAddr,

    /// Bind address for the admission webhook
    #[arg(long, default_value = "0.0.0.0:8443")]
    webhook_addr: SocketAddr,

    /// PEM certificate for the webhook listener; self-signed when absent
    #[arg(long)]
    webhook_cert: Option<String>,

    /// PEM private key for the webhook listener
    #[arg(long)]
    webhook_key: Option<String>,

    /// Disable the admission webhook server
    #[arg(long)]
    disable_webhook: bool,

    /// Accepted for manifest compatibility; this operator runs as a single
    /// replica
    #[arg(long)]
    leader_elect: bool,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    info!("Starting AIOps Operator v{}", env!("CARGO_PKG_VERSION"));

    if args.leader_elect {
        warn!("--leader-elect is accepted but not implemented; run one replica");
    }

    let client = kube::Client::try_default().await.map_err(Error::KubeError)?;
    info!("Connected to Kubernetes cluster");

    // Health probes
    let probe_app = axum::Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }));
    let probe_addr = args.probe_addr;
    tokio::spawn(async move {
        match tokio::net::TcpListener::bind(probe_addr).await {
            Ok(listener) => {
                if let Err(e) = axum::serve(listener, probe_app).await {
                    tracing::error!("probe server error: {e}");
                }
            }
            Err(e) => tracing::error!("probe server bind error: {e}"),
        }
    });

    // Admission webhook
    if !args.disable_webhook {
        let tls = match (args.webhook_cert.clone(), args.webhook_key.clone()) {
            (Some(cert_path), Some(key_path)) => Some(TlsConfig {
                cert_path,
                key_path,
            }),
            _ => None,
        };
        let server = WebhookServer::new(args.webhook_addr, tls);
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                tracing::error!("webhook server error: {:?}", e);
            }
        });
    }

    // Controller contexts; collaborators are injected here.
    let detector = Arc::new(controller::DetectorContext {
        client: client.clone(),
    });
    let remediation = Arc::new(controller::RemediationContext {
        client: client.clone(),
        llm: OllamaClient::new(args.ollama_url, args.ollama_model),
    });
    let rollout = Arc::new(controller::RolloutContext {
        client: client.clone(),
        traffic: Arc::new(NginxIngressProvider::new(client.clone())),
        analysis: Arc::new(ReadyEngine::new(client.clone())),
        status: Arc::new(controller::KubeStatusWriter::new(client.clone())),
    });
    let nginx = Arc::new(controller::NginxContext {
        client: client.clone(),
    });

    tokio::try_join!(
        controller::run_detector(detector),
        controller::run_remediation_controller(remediation),
        controller::run_rollout_controller(rollout),
        controller::run_nginx_controller(nginx),
    )?;

    Ok(())
}

//! `aiops-propose`: evidence-only proposal CLI
//!
//! Collects the evidence document for one pod (including previous-container
//! logs, `kubectl logs -p` style), sends it to the LLM and pretty-prints
//! the proposal. Exit codes: 0 success, 1 collect/LLM error, 2 usage error.

use anyhow::Context;
use clap::Parser;
use k8s_openapi::api::core::v1::{Event, Pod};
use kube::{api::ListParams, Api, Client};

use aiops_operator::evidence;
use aiops_operator::llm::{OllamaClient, SYSTEM_PROMPT};

#[derive(Parser, Debug)]
#[command(
    name = "aiops-propose",
    about = "Collect pod evidence and ask the LLM for a minimal remediation patch"
)]
struct Args {
    /// Namespace of the pod
    #[arg(short = 'n', long = "namespace", default_value = "default")]
    namespace: String,

    /// Pod name
    #[arg(short = 'p', long = "pod")]
    pod: String,

    /// Container to read previous logs from (defaults to the first one)
    #[arg(short = 'c', long = "container")]
    container: Option<String>,

    /// Ollama base URL
    #[arg(long = "ollama", env = "OLLAMA_URL", default_value = "http://127.0.0.1:11434")]
    ollama: String,

    /// Model name
    #[arg(long = "model", env = "OLLAMA_MODEL", default_value = "qwen2.5:7b")]
    model: String,
}

async fn run(args: Args) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .context("connecting to the cluster")?;

    let pods: Api<Pod> = Api::namespaced(client.clone(), &args.namespace);
    let pod = pods
        .get(&args.pod)
        .await
        .with_context(|| format!("fetching pod {}/{}", args.namespace, args.pod))?;

    let events_api: Api<Event> = Api::namespaced(client.clone(), &args.namespace);
    let events = events_api
        .list(&ListParams::default())
        .await
        .map(|list| list.items)
        .unwrap_or_default();

    let previous_logs =
        evidence::previous_logs(&client, &pod, args.container.as_deref()).await;

    let ev = evidence::build(&pod, &events, previous_logs);
    let evidence_bytes = serde_json::to_vec(&ev).context("serializing evidence")?;

    let llm = OllamaClient::new(args.ollama, args.model);
    let proposal = llm
        .propose(SYSTEM_PROMPT, &evidence_bytes)
        .await
        .context("requesting proposal")?;

    println!("{}", serde_json::to_string_pretty(&proposal)?);
    Ok(())
}

#[tokio::main]
async fn main() {
    // clap exits with code 2 on usage errors.
    let args = Args::parse();

    if let Err(e) = run(args).await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

mod session;

use anyhow::{bail, Context, Result};
use clap::Parser;
use console::style;
use magpie::agent::Agent;
use magpie::preprocess::DocQueryPreprocessor;
use magpie::providers::base::Provider;
use magpie::providers::configs::OpenRouterProviderConfig;
use magpie::providers::factory::ProviderType;
use magpie::providers::openrouter::OpenRouterProvider;
use magpie::router::{ToolRouter, ToolServer};
use magpie::sampling::SamplingBridge;
use magpie::transport::{ServerConfig, TransportClient};
use session::Session;
use std::sync::Arc;
use std::time::Duration;
use strum::IntoEnumIterator;
use tracing_subscriber::EnvFilter;

const DEFAULT_MODEL: &str = "mistralai/mistral-7b-instruct";

#[derive(Parser)]
#[command(name = "magpie", about = "Chat with a model that can drive local tool servers")]
struct Cli {
    /// Command used to launch the document tool server
    #[arg(long, default_value = "doc-server")]
    doc_server: String,

    /// Extra arguments passed to the tool server command
    #[arg(long = "doc-server-arg")]
    doc_server_args: Vec<String>,

    /// Completion provider to use
    #[arg(long, default_value = "openrouter")]
    provider: String,

    /// Model identifier; falls back to MAGPIE_MODEL
    #[arg(long)]
    model: Option<String>,

    /// Run a single prompt and exit instead of starting a session
    #[arg(long)]
    prompt: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    // Logs go to stderr so they never interleave with the conversation.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if !ProviderType::iter().any(|provider| provider.to_string() == cli.provider) {
        let supported: Vec<String> = ProviderType::iter().map(|p| p.to_string()).collect();
        bail!(
            "unknown provider '{}'; supported providers: {}",
            cli.provider,
            supported.join(", ")
        );
    }

    let api_key = std::env::var("OPENROUTER_API_KEY")
        .context("OPENROUTER_API_KEY must be set (a .env file works too)")?;
    let model = cli
        .model
        .or_else(|| std::env::var("MAGPIE_MODEL").ok())
        .unwrap_or_else(|| DEFAULT_MODEL.to_string());

    eprintln!("{}", style(format!("Using model: {model}")).dim());

    let provider: Arc<dyn Provider> = Arc::new(OpenRouterProvider::new(
        OpenRouterProviderConfig::new(api_key, model.clone()),
    )?);

    let bridge = Arc::new(SamplingBridge::new(Arc::clone(&provider), model));
    let config = ServerConfig::new("docs", cli.doc_server, cli.doc_server_args);
    let client = TransportClient::connect(config, Some(bridge))
        .await
        .context("failed to start the document tool server")?;
    let handle: Arc<dyn ToolServer> = Arc::new(client.clone());

    match handle.list_tools(Duration::from_secs(10)).await {
        Ok(tools) => {
            let names: Vec<&str> = tools.iter().map(|tool| tool.name.as_str()).collect();
            eprintln!(
                "{}",
                style(format!("Connected to doc server ({} tools: {})", names.len(), names.join(", ")))
                    .dim()
            );
        }
        Err(err) => eprintln!("{}", style(format!("Warning: tool listing failed: {err}")).yellow()),
    }

    let mut router = ToolRouter::new();
    router.register(Arc::clone(&handle));

    let agent = Agent::new(provider, router)
        .with_preprocessor(Box::new(DocQueryPreprocessor::new(handle)));

    let result = match cli.prompt {
        Some(prompt) => {
            let mut agent = agent;
            let answer = agent.run(&prompt).await;
            println!("{answer}");
            Ok(())
        }
        None => {
            println!("{}", style("Reference documents with @name, prompt templates with /name <doc>.").dim());
            println!("{}", style("Type 'exit' or press Ctrl-D to quit.").dim());
            Session::new(agent).start().await
        }
    };

    client.shutdown().await;
    result
}

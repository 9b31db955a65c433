//! `model-runtime chat|models|image` against providers configured from the
//! environment or a JSON file.

use std::error::Error;
use std::io::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::StreamExt as _;
use model_runtime::prelude::*;
use model_runtime::{TextToImagePayload, init_observability};
use tokio::io::AsyncWriteExt as _;
use tracing::{info, warn};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON runtime configuration; providers are read from the environment when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Provider or router id.
    #[arg(long, short, global = true, default_value = "openai")]
    provider: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one user prompt and print the answer as it streams.
    Chat {
        #[arg(long, short)]
        model: String,
        /// Optional system prompt.
        #[arg(long)]
        system: Option<String>,
        /// Print the canonical SSE frames instead of plain text.
        #[arg(long)]
        sse: bool,
        /// Ask the provider for a single non-streaming response.
        #[arg(long)]
        no_stream: bool,
        #[arg(long)]
        timeout_secs: Option<u64>,
        prompt: String,
    },
    /// List the models the provider serves.
    Models,
    /// Generate images and print their URLs.
    Image {
        #[arg(long, short)]
        model: String,
        #[arg(long)]
        size: Option<String>,
        prompt: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let _ = dotenvy::dotenv();
    init_observability();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => RuntimeConfig::from_path(path)?,
        None => RuntimeConfig::from_env(),
    };
    let registry = config.into_registry()?;
    let runtime = registry.runtime(&ProviderId::new(cli.provider.as_str()))?;
    info!(provider = %runtime.id(), "runtime ready");

    match cli.command {
        Commands::Chat {
            model,
            system,
            sse,
            no_stream,
            timeout_secs,
            prompt,
        } => {
            let mut messages = Vec::new();
            if let Some(system) = system {
                messages.push(ChatMessage::system(system));
            }
            messages.push(ChatMessage::user(prompt));
            let payload = ChatStreamPayload::new(model, messages).stream(!no_stream);

            let abort = AbortHandle::new();
            let mut options = ChatOptions::default().abort(abort.clone());
            if let Some(secs) = timeout_secs {
                options = options.timeout(Duration::from_secs(secs));
            }
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupted, aborting stream");
                    abort.abort();
                }
            });

            let stream = runtime.chat(&payload, options).await?;
            if sse {
                let mut frames = Box::pin(stream.into_sse());
                let mut stdout = tokio::io::stdout();
                while let Some(frame) = frames.next().await {
                    stdout.write_all(&frame).await?;
                    stdout.flush().await?;
                }
            } else {
                print_text(stream).await?;
            }
        }
        Commands::Models => {
            for card in runtime.models().await? {
                match card.owned_by {
                    Some(owner) => println!("{}\t{owner}", card.id),
                    None => println!("{}", card.id),
                }
            }
        }
        Commands::Image {
            model,
            size,
            prompt,
        } => {
            let mut payload = TextToImagePayload::new(model, prompt);
            payload.size = size;
            for image in runtime.text_to_image(&payload).await? {
                match (image.url, image.b64_json) {
                    (Some(url), _) => println!("{url}"),
                    (None, Some(data)) => println!("<{} bytes of base64>", data.len()),
                    (None, None) => {}
                }
            }
        }
    }
    Ok(())
}

/// Text to stdout, reasoning to stderr, usage as a trailing line.
async fn print_text(mut stream: ChatStream) -> Result<(), Box<dyn Error>> {
    let mut stdout = std::io::stdout();
    while let Some(chunk) = stream.next_chunk().await {
        match chunk.data {
            ChunkData::Text(text) => {
                write!(stdout, "{text}")?;
                stdout.flush()?;
            }
            ChunkData::Reasoning(text) => eprint!("{text}"),
            ChunkData::ToolCalls(deltas) => {
                for delta in deltas {
                    if let Some(name) = delta.function.name {
                        eprintln!("\n[tool call {}: {name}]", delta.index);
                    }
                }
            }
            ChunkData::Usage(usage) => {
                eprintln!("\n[usage] {}", serde_json::to_string(&usage)?);
            }
            ChunkData::Stop(reason) => {
                println!();
                info!(finish_reason = %reason, "stream finished");
            }
            ChunkData::Error(err) => return Err(err.into()),
        }
    }
    if stream.abort_handle().is_aborted() {
        return Err(AgentRuntimeError::cancelled(stream.provider().clone()).into());
    }
    Ok(())
}

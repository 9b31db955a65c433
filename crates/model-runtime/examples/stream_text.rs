use model_runtime::prelude::*;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    model_runtime::init_observability();
    let runtime = create_runtime(
        ProviderConfig::from_env("openai", ProviderKind::OpenAi)?.into_descriptor()?,
    )?;

    let payload = ChatStreamPayload::new(
        "gpt-4o-mini",
        vec![
            ChatMessage::system("Reply briefly."),
            ChatMessage::user("Stream a greeting."),
        ],
    );
    let mut stream = runtime.chat(&payload, ChatOptions::default()).await?;

    while let Some(chunk) = stream.next_chunk().await {
        match chunk.data {
            ChunkData::Text(text) => print!("{text}"),
            ChunkData::Reasoning(text) => eprint!("{text}"),
            ChunkData::Stop(_) => println!(),
            ChunkData::Error(error) => eprintln!("stream error: {error}"),
            ChunkData::ToolCalls(_) | ChunkData::Usage(_) => {}
        }
    }
    Ok(())
}

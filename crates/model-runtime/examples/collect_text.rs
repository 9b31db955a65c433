use model_runtime::prelude::*;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let runtime = create_runtime(
        ProviderConfig::from_env("openai", ProviderKind::OpenAi)?.into_descriptor()?,
    )?;

    let payload = ChatStreamPayload::new("gpt-4o-mini", vec![ChatMessage::user("Say hello in five words.")]);
    let result = runtime
        .chat(&payload, ChatOptions::default())
        .await?
        .collect()
        .await?;

    println!("{}", result.text);
    if let Some(usage) = result.usage {
        println!("tokens: {} in / {} out", usage.prompt_tokens, usage.completion_tokens);
    }
    Ok(())
}

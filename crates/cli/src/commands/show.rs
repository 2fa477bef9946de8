//! `quill show`: Decrypt and print one conversation.

use anyhow::Context;
use quill_config::AppConfig;
use quill_core::message::ConversationId;

pub async fn run(id: &str) -> anyhow::Result<()> {
    let config = AppConfig::load().context("Failed to load config")?;
    let secret = super::secret()?;
    let store = super::conversation_store(&config);

    let record = store
        .load(&ConversationId::from(id), &secret)
        .await?
        .with_context(|| format!("Conversation not found: {id}"))?;

    println!("{}", record.title);
    println!("  {} / {}", record.provider, record.model);
    println!("  updated {}", record.updated_at.format("%Y-%m-%d %H:%M"));
    println!();
    for message in &record.messages {
        for line in message.content.lines() {
            println!("  {:>9} > {line}", message.role.as_str());
        }
        println!();
    }

    Ok(())
}

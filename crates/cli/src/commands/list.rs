//! `quill list`: Stored conversations, newest first.

use anyhow::Context;
use quill_config::AppConfig;

pub async fn run() -> anyhow::Result<()> {
    let config = AppConfig::load().context("Failed to load config")?;
    let store = super::conversation_store(&config);
    let ids = store.list().await?;

    if ids.is_empty() {
        println!("No conversations in {}", config.storage.conversations_dir.display());
        return Ok(());
    }

    // Titles are encrypted; without a secret only ids can be shown.
    let Ok(secret) = super::secret() else {
        for id in ids {
            println!("  {id}");
        }
        return Ok(());
    };

    let mut rows = Vec::new();
    for id in ids {
        match store.load(&id, &secret).await {
            Ok(Some(record)) => rows.push((Some(record.updated_at), id, record.title)),
            Ok(None) => {}
            Err(e) => rows.push((None, id, format!("({e})"))),
        }
    }
    rows.sort_by(|a, b| b.0.cmp(&a.0));

    for (updated, id, title) in rows {
        let when = updated.map_or_else(|| "-".repeat(16), |t| t.format("%Y-%m-%d %H:%M").to_string());
        println!("  {id}  {when}  {title}");
    }

    Ok(())
}

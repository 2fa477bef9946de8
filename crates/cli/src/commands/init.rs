//! `quill init`: First-time setup.

use quill_config::AppConfig;

pub async fn run() -> anyhow::Result<()> {
    let config_dir = AppConfig::config_dir();
    let config_path = config_dir.join("config.toml");

    println!("Quill — First-Time Setup");
    println!("========================\n");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
        println!("✅ Created config directory: {}", config_dir.display());
    } else {
        println!("  Config directory exists: {}", config_dir.display());
    }

    if config_path.exists() {
        println!("\n⚠️  Config already exists at: {}", config_path.display());
        println!("   Edit it manually or delete and re-run init.\n");
    } else {
        std::fs::write(&config_path, AppConfig::default_toml())?;
        println!("✅ Created config.toml at: {}", config_path.display());
    }

    let config = AppConfig::load_from(&config_path)?;
    let conversations = &config.storage.conversations_dir;
    if !conversations.exists() {
        std::fs::create_dir_all(conversations)?;
        println!("✅ Created conversations directory: {}", conversations.display());
    }

    println!("\n📝 Next steps:");
    println!("   1. Pick a provider in {}", config_path.display());
    println!("   2. export QUILL_SECRET=...   (encrypts your conversations)");
    println!("   3. quill chat -m \"hello\"\n");

    Ok(())
}

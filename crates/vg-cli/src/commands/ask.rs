use anyhow::{bail, Result};
use vg_core::Config;
use vg_intelligence::chat::ask_once;

/// One-shot question to the senior tier.
pub async fn run(config: Config, question: &str) -> Result<()> {
    if question.trim().is_empty() {
        bail!("ask requires a question");
    }
    let tier = super::meta_tier(&config);
    let header = super::system_header(&config);
    let reply = ask_once(&tier, &header, question).await?;
    println!("{reply}");
    Ok(())
}

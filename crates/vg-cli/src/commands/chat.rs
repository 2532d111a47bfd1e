use std::io::{BufRead, Write};

use anyhow::Result;
use vg_core::Config;
use vg_intelligence::chat::ChatSession;

/// Interactive session with the senior tier. Exit with `quit` or EOF.
pub async fn run(config: Config) -> Result<()> {
    let tier = super::meta_tier(&config);
    let mut session = ChatSession::new(tier, super::system_header(&config));

    println!("vigil chat on {} (quit to exit)", config.hostname());
    let stdin = std::io::stdin();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "quit" || line == "exit" {
            break;
        }

        match session.send(line).await {
            Ok(reply) => println!("{reply}\n"),
            Err(e) => eprintln!("(backend error: {e})\n"),
        }
    }
    Ok(())
}

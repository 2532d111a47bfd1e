pub mod approve;
pub mod ask;
pub mod chat;
pub mod check;
pub mod issues;
pub mod logs;
pub mod notify;
pub mod run;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use vg_core::Config;
use vg_daemon::executor::{Executor, ShellRunner};
use vg_daemon::probe::SystemctlProbe;
use vg_daemon::queue::ApprovalQueue;
use vg_intelligence::llm::{HttpLlmClient, TierClient};

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::load().context("loading config")?,
    };
    Ok(config)
}

/// Client for the large tier, used by `ask` and `chat`.
pub fn meta_tier(config: &Config) -> TierClient {
    TierClient::new(
        Arc::new(HttpLlmClient::new(&config.meta.backend_url)),
        &config.meta.model,
        8192,
        Duration::from_secs(config.meta.timeout_s),
        2,
    )
}

/// System prompt header for interactive sessions.
pub fn system_header(config: &Config) -> String {
    format!(
        "You are vigil, the autonomous monitor for host {}. Autonomy level: {}. \
         Answer operator questions about system health plainly; propose actions \
         only when asked.",
        config.hostname(),
        config.executor.autonomy_level,
    )
}

/// An executor over the on-disk queue, for approval operations outside the
/// daemon process.
pub fn standalone_executor(config: &Config) -> Result<Executor> {
    let state_dir = config.state_dir();
    let queue = ApprovalQueue::load(&state_dir).context("loading approval queue")?;
    Ok(Executor::new(
        config.executor.autonomy_level,
        config.executor.protected_services.clone(),
        Duration::from_secs(config.executor.action_timeout_s),
        config.executor.queue_pause_depth,
        Arc::new(ShellRunner),
        Arc::new(SystemctlProbe),
        &state_dir,
        queue,
    ))
}

//! The agent-notification sink: two endpoints on a trusted local host,
//! bearer-token authorized, strictly fire-and-forget.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use common::config::NodeConfig;
use satchel_net::{
    handler::NoopNotifier, AgentNotifier, NotifyKind,
};
use tracing::debug;

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Build the configured notifier, or a no-op when no sink is configured.
pub fn from_config(config: &NodeConfig) -> Arc<dyn AgentNotifier> {
    match &config.agent_hooks_url {
        Some(base_url) => Arc::new(AgentHooksNotifier::new(
            base_url.clone(),
            config.agent_hooks_token.clone(),
        )),
        None => Arc::new(NoopNotifier),
    }
}

pub struct AgentHooksNotifier {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl AgentHooksNotifier {
    pub fn new(base_url: String, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_owned(),
            token,
        }
    }
}

#[async_trait]
impl AgentNotifier for AgentHooksNotifier {
    async fn notify(&self, kind: NotifyKind, summary: String) {
        let path = match kind {
            NotifyKind::Wake => "/hooks/wake",
            NotifyKind::Agent => "/hooks/agent",
        };
        let url = format!("{}{path}", self.base_url);

        let mut request = self
            .client
            .post(url)
            .timeout(NOTIFY_TIMEOUT)
            .json(&serde_json::json!({ "text": summary }));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        // Best-effort: failures are logged and ignored, never propagated
        // into protocol processing.
        match request.send().await {
            Ok(response) if response.status().is_success() => (),
            Ok(response) =>
                debug!("Agent notification rejected: {}", response.status()),
            Err(e) => debug!("Agent notification failed: {e}"),
        }
    }
}

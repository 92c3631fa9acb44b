pub mod api;
pub mod websocket;

use crate::agent::{ AgentOptions, ChatAgent, RollbackPolicy };
use crate::cli::Args;
use crate::config::prompt::{ self, PromptConfig };
use crate::history::HistoryStore;
use crate::llm::chat::ChatClient;
use chrono::Utc;
use log::warn;
use std::error::Error;
use std::path::{ Path, PathBuf };
use std::sync::Arc;
use tokio::sync::RwLock;

/// What every connection shares: the model client, the history store and the prompts.
/// Transcripts and agents are per connection.
#[derive(Clone)]
pub struct AppContext {
    pub client: Arc<dyn ChatClient>,
    pub history: Option<Arc<dyn HistoryStore>>,
    pub rollback_policy: RollbackPolicy,
    prompts: Arc<RwLock<Arc<PromptConfig>>>,
    prompts_path: Option<PathBuf>,
}

impl AppContext {
    pub fn new(
        client: Arc<dyn ChatClient>,
        history: Option<Arc<dyn HistoryStore>>,
        prompts: Arc<PromptConfig>,
        rollback_policy: RollbackPolicy
    ) -> Self {
        Self {
            client,
            history,
            rollback_policy,
            prompts: Arc::new(RwLock::new(prompts)),
            prompts_path: None,
        }
    }

    /// Re-reads the prompt file before each new agent when it changed on disk.
    pub fn with_prompts_path(mut self, path: impl AsRef<Path>) -> Self {
        self.prompts_path = Some(path.as_ref().to_path_buf());
        self
    }

    async fn refresh_prompts(&self) {
        let Some(path) = self.prompts_path.as_ref() else {
            return;
        };
        if !path.exists() {
            return;
        }
        let current = self.prompts.read().await.clone();
        match prompt::reload_prompts_if_changed(path, &current) {
            Ok(Some(updated)) => {
                *self.prompts.write().await = updated;
            }
            Ok(None) => {}
            Err(e) => warn!("Keeping previous prompts, reload failed: {}", e),
        }
    }

    pub async fn new_agent(&self) -> ChatAgent {
        self.refresh_prompts().await;
        let system_prompt = self.prompts.read().await.render_system_prompt(Utc::now());
        ChatAgent::new(self.client.clone(), self.history.clone(), AgentOptions {
            system_prompt: Some(system_prompt),
            rollback_policy: self.rollback_policy,
        })
    }
}

pub struct Server {
    addr: String,
    context: AppContext,
    args: Args,
}

impl Server {
    pub fn new(addr: String, context: AppContext, args: Args) -> Self {
        Self {
            addr,
            context,
            args,
        }
    }

    pub async fn run(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        if let Some(http_port) = self.args.http_port {
            self.start_http_server(http_port).await?;
        }

        self.start_ws_server().await?;

        Ok(())
    }

    async fn start_http_server(&self, http_port: u16) -> Result<(), Box<dyn Error + Send + Sync>> {
        api::start_http_server(http_port, self.context.history.clone()).await
    }

    async fn start_ws_server(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        websocket::start_ws_server(&self.addr, self.context.clone()).await
    }
}

pub mod agent;
pub mod cli;
pub mod config;
pub mod error;
pub mod history;
pub mod llm;
pub mod models;
pub mod server;
pub mod transcript;

use cli::Args;
use config::prompt::{ self, PromptConfig };
use history::initialize_history_store;
use llm::chat::new_client as new_chat_client;
use log::info;
use server::{ AppContext, Server };
use std::error::Error;
use std::path::Path;
use std::sync::Arc;

fn load_prompt_config(path: &str) -> Result<Arc<PromptConfig>, Box<dyn Error + Send + Sync>> {
    if Path::new(path).exists() {
        Ok(prompt::load_prompts(path)?)
    } else {
        info!("No prompt file at {}, using the built-in system prompt", path);
        Ok(Arc::new(PromptConfig::default()))
    }
}

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!("--- Core Configuration ---");
    info!("Server Address: {}", args.server_addr);
    info!("HTTP API Port: {}", args.http_port.map(|p| p.to_string()).unwrap_or("disabled".into()));
    info!("Chat LLM Type: {}", args.chat_llm_type);
    info!("Chat Model: {}", args.chat_model.as_deref().unwrap_or("adapter default"));
    info!("Simulated Chunking: {} ({} ms)", args.simulated_chunking, args.simulated_delay_ms);
    info!("History Store Type: {}", args.history_type);
    info!("History Store Host: {}", args.history_host);
    info!("Rollback Policy: {}", args.rollback_policy);
    info!("Prompts Path: {}", args.prompts_path);
    info!("-------------------------");

    let llm_config = args.llm_config()?;
    let chat_client = new_chat_client(&llm_config)?;
    info!(
        "Chat client configured: Type={}, Model={}, BaseURL={}",
        chat_client.get_llm_type(),
        chat_client.get_model(),
        chat_client.get_base_url().as_deref().unwrap_or("adapter default")
    );

    let history = initialize_history_store(&args)?;
    if history.is_none() {
        info!("Running in guest mode, conversations are not persisted");
    }

    let prompts = load_prompt_config(&args.prompts_path)?;
    let context = AppContext::new(
        chat_client,
        history,
        prompts,
        args.rollback_policy()?
    ).with_prompts_path(&args.prompts_path);

    let addr = args.server_addr.clone();
    info!("Starting server on: {}", addr);
    let server = Server::new(addr, context, args.clone());
    server.run().await?;

    Ok(())
}

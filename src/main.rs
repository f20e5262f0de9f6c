use std::sync::Arc;
use std::time::Duration;

use attache::claude::{ClaudeClient, CompletionClient, UnconfiguredModel};
use attache::config;
use attache::db::IntelDb;
use attache::google_api::gmail::GmailMailer;
use attache::google_api::GoogleTokenProvider;
use attache::server::{self, AppState};
use attache::sync::{FileCredentialStore, SyncCoordinator};
use parking_lot::RwLock;

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match config::load_config() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let db_path = match IntelDb::default_path() {
        Ok(path) => path,
        Err(e) => {
            log::error!("Failed to resolve database path: {}", e);
            std::process::exit(1);
        }
    };

    let llm_timeout = Duration::from_secs(config.llm_timeout_secs);
    let mail_timeout = Duration::from_secs(config.mail_timeout_secs);

    let model: Arc<dyn CompletionClient> =
        match ClaudeClient::from_env(&config.claude, llm_timeout) {
            Ok(client) => Arc::new(client),
            Err(e) => {
                log::warn!("Claude client unavailable: {}. Extraction and chat will fail until ANTHROPIC_API_KEY is set.", e);
                Arc::new(UnconfiguredModel)
            }
        };

    let credentials = Arc::new(FileCredentialStore);
    let coordinator = Arc::new(SyncCoordinator::new(
        Arc::new(GoogleTokenProvider::new(mail_timeout)),
        Arc::new(GmailMailer::new(mail_timeout, config.excerpt_chars)),
        Arc::clone(&model),
        credentials.clone(),
        db_path.clone(),
        config.max_results,
    ));

    let listen_addr = config.listen_addr.clone();
    let state = Arc::new(AppState {
        config: RwLock::new(config),
        coordinator,
        model,
        credentials,
        current_user: RwLock::new(None),
        db_path,
    });

    let listener = match tokio::net::TcpListener::bind(&listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("Failed to bind {}: {}", listen_addr, e);
            std::process::exit(1);
        }
    };

    log::info!("Attache listening on http://{}", listen_addr);
    if let Err(e) = axum::serve(listener, server::router(state)).await {
        log::error!("Server error: {}", e);
        std::process::exit(1);
    }
}

mod config;
mod gemini;
mod handlers;
mod search;
mod store;

use std::sync::Arc;

use teloxide::prelude::*;
use tracing::info;
use tracing_subscriber::prelude::*;

use config::Config;
use gemini::GeminiClient;
use handlers::{BotState, Command, handle_chat, handle_command, handle_contact, handle_media};
use search::StubSearch;
use store::Store;

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "gembot.json".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        }
    };

    // Setup logging
    let log_dir = config.data_dir.join("logs");
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("fatal: failed to create log dir '{}': {e}", log_dir.display());
        std::process::exit(1);
    }
    let log_file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("gembot.log"))
    {
        Ok(file) => file,
        Err(e) => {
            eprintln!("fatal: failed to open log file: {e}");
            std::process::exit(1);
        }
    };
    let (non_blocking, _guard) = tracing_appender::non_blocking(log_file);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .init();

    info!("🚀 Starting gembot...");
    info!("Loaded config from {config_path}");

    let store = match Store::open(&config.database_path) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = std::fs::create_dir_all(&config.download_dir) {
        eprintln!(
            "fatal: failed to create download dir '{}': {e}",
            config.download_dir.display()
        );
        std::process::exit(1);
    }

    let bot = Bot::new(&config.telegram_bot_token);
    let gemini = GeminiClient::new(config.gemini_api_key.clone());
    let state = Arc::new(BotState {
        config,
        store,
        gemini,
        search: Box::new(StubSearch),
    });

    let handler = Update::filter_message()
        .branch(
            dptree::entry()
                .filter_command::<Command>()
                .endpoint(handle_command),
        )
        .branch(dptree::filter(|msg: Message| msg.contact().is_some()).endpoint(handle_contact))
        .branch(dptree::filter(|msg: Message| msg.photo().is_some()).endpoint(handle_media))
        .branch(
            // Commands never fall through to the chat handler
            dptree::filter(|msg: Message| msg.text().is_some_and(handlers::is_plain_text))
                .endpoint(handle_chat),
        );

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}

//! Event handlers: registration, contact capture, chat relay, media, search.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{ButtonRequest, FileId, KeyboardButton, KeyboardMarkup};
use teloxide::utils::command::BotCommands;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::gemini::GeminiClient;
use crate::search::{SearchProvider, format_results};
use crate::store::{ChatHistoryEntry, FileRecord, Store, StoreError, User, now_timestamp};

/// Shared state built once at startup and injected into every handler.
pub struct BotState {
    pub config: Config,
    pub store: Store,
    pub gemini: GeminiClient,
    pub search: Box<dyn SearchProvider>,
}

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase")]
pub enum Command {
    /// Register with the bot.
    Start,
    /// Search the web.
    Websearch(String),
}

const WELCOME_TEXT: &str = "Welcome! Please share your phone number.";
const ALREADY_REGISTERED_TEXT: &str = "You are already registered!";

/// Text that should go to the chat handler: anything that isn't a command.
pub fn is_plain_text(text: &str) -> bool {
    !text.starts_with('/')
}

pub async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    state: Arc<BotState>,
) -> ResponseResult<()> {
    match cmd {
        Command::Start => handle_start(bot, msg, state).await,
        Command::Websearch(query) => handle_websearch(bot, msg, query, state).await,
    }
}

/// What a /start attempt resolved to.
#[derive(Debug, PartialEq)]
pub enum RegistrationOutcome {
    Registered,
    AlreadyRegistered,
}

/// Attempt registration. The users table's primary key is the sole arbiter:
/// no existence pre-check, a duplicate insert means "already registered".
pub fn register_user(
    store: &Store,
    chat_id: i64,
    first_name: &str,
    username: Option<&str>,
) -> Result<RegistrationOutcome, StoreError> {
    let user = User {
        chat_id,
        first_name: first_name.to_string(),
        username: username.map(str::to_string),
        phone_number: None,
    };
    match store.insert_user(&user) {
        Ok(()) => Ok(RegistrationOutcome::Registered),
        Err(StoreError::Duplicate) => Ok(RegistrationOutcome::AlreadyRegistered),
        Err(e) => Err(e),
    }
}

/// One-time reply keyboard with a single contact-request button.
fn contact_keyboard() -> KeyboardMarkup {
    let button = KeyboardButton::new("Share phone number").request(ButtonRequest::Contact);
    KeyboardMarkup::new(vec![vec![button]]).one_time_keyboard()
}

async fn handle_start(bot: Bot, msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    let chat_id = msg.chat.id.0;
    let Some(user) = msg.from.as_ref() else {
        return Ok(());
    };

    match register_user(&state.store, chat_id, &user.first_name, user.username.as_deref()) {
        Ok(RegistrationOutcome::Registered) => {
            info!("🆕 Registered chat {chat_id} ({})", user.first_name);
            bot.send_message(msg.chat.id, WELCOME_TEXT)
                .reply_markup(contact_keyboard())
                .await?;
        }
        Ok(RegistrationOutcome::AlreadyRegistered) => {
            bot.send_message(msg.chat.id, ALREADY_REGISTERED_TEXT).await?;
        }
        Err(e) => {
            error!("Registration failed for chat {chat_id}: {e}");
        }
    }

    Ok(())
}

fn contact_ack(first_name: &str) -> String {
    format!("Thank you, {first_name}! Your phone number has been registered.")
}

pub async fn handle_contact(bot: Bot, msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    let chat_id = msg.chat.id.0;
    let Some(contact) = msg.contact() else {
        return Ok(());
    };

    if let Err(e) = state.store.update_user_phone(chat_id, &contact.phone_number) {
        error!("Phone update failed for chat {chat_id}: {e}");
        return Ok(());
    }

    let first_name = msg
        .from
        .as_ref()
        .map(|u| u.first_name.as_str())
        .unwrap_or(&contact.first_name);
    info!("📞 Recorded phone number for chat {chat_id}");
    bot.send_message(msg.chat.id, contact_ack(first_name)).await?;

    Ok(())
}

pub async fn handle_chat(bot: Bot, msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    let chat_id = msg.chat.id.0;
    let Some(text) = msg.text() else {
        return Ok(());
    };

    let reply = match state.gemini.generate(text).await {
        Ok(reply) => reply,
        Err(e) => {
            // Attempted exactly once; this event is done
            error!("Gemini call failed for chat {chat_id}: {e}");
            return Ok(());
        }
    };

    bot.send_message(msg.chat.id, reply.as_str()).await?;
    record_exchange(&state.store, state.config.record_chat_history, chat_id, text, &reply);

    Ok(())
}

/// Append the exchange to chat history when recording is enabled. A failed
/// append is logged and does not retract the already-sent reply.
fn record_exchange(
    store: &Store,
    enabled: bool,
    chat_id: i64,
    user_message: &str,
    bot_response: &str,
) {
    if !enabled {
        return;
    }
    let entry = ChatHistoryEntry {
        chat_id,
        user_message: user_message.to_string(),
        bot_response: bot_response.to_string(),
        timestamp: now_timestamp(),
    };
    if let Err(e) = store.append_chat_history(&entry) {
        warn!("Failed to record chat history for chat {chat_id}: {e}");
    }
}

/// Local file name for a downloaded attachment. Derived from the remote
/// path's final segment, prefixed with the chat id to avoid collisions.
fn local_file_name(remote_path: &str, chat_id: i64) -> String {
    let name = Path::new(remote_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("attachment.bin");
    format!("{chat_id}_{name}")
}

async fn download_attachment(
    bot: &Bot,
    file_id: &FileId,
    download_dir: &Path,
    chat_id: i64,
) -> Result<PathBuf, String> {
    let file = bot
        .get_file(file_id.clone())
        .await
        .map_err(|e| format!("failed to get file info: {e}"))?;

    let mut data = Vec::new();
    bot.download_file(&file.path, &mut data)
        .await
        .map_err(|e| format!("failed to download file: {e}"))?;

    let local = download_dir.join(local_file_name(&file.path, chat_id));
    tokio::fs::write(&local, &data)
        .await
        .map_err(|e| format!("failed to write {}: {e}", local.display()))?;

    info!("📥 Downloaded attachment ({} bytes) to {}", data.len(), local.display());
    Ok(local)
}

/// Drive the per-attachment sequence: `deliver` each attachment strictly in
/// order (download + reply), then record its metadata. A failure at one
/// attachment skips all remaining ones in the same event. Returns how many
/// attachments were delivered.
async fn relay_attachments<F, Fut>(
    store: &Store,
    chat_id: i64,
    description: &str,
    count: usize,
    mut deliver: F,
) -> usize
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<String, String>>,
{
    for index in 0..count {
        match deliver(index).await {
            Ok(file_path) => {
                let record = FileRecord {
                    chat_id,
                    file_path,
                    description: description.to_string(),
                    timestamp: now_timestamp(),
                };
                if let Err(e) = store.append_file_record(&record) {
                    warn!("Failed to record file metadata for chat {chat_id}: {e}");
                }
            }
            Err(e) => {
                warn!("Attachment download failed for chat {chat_id}: {e}");
                return index;
            }
        }
    }
    count
}

pub async fn handle_media(bot: Bot, msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    let chat_id = msg.chat.id.0;
    let chat = msg.chat.id;
    let Some(photos) = msg.photo() else {
        return Ok(());
    };
    let description = msg.caption().unwrap_or("photo");

    let bot = &bot;
    let state = &state;
    relay_attachments(&state.store, chat_id, description, photos.len(), |index| {
        let photo = &photos[index];
        async move {
            let path =
                download_attachment(bot, &photo.file.id, &state.config.download_dir, chat_id)
                    .await?;
            let file_path = path.display().to_string();
            bot.send_message(chat, format!("File downloaded to: {file_path}"))
                .await
                .map_err(|e| format!("failed to send reply: {e}"))?;
            Ok(file_path)
        }
    })
    .await;

    Ok(())
}

async fn handle_websearch(
    bot: Bot,
    msg: Message,
    query: String,
    state: Arc<BotState>,
) -> ResponseResult<()> {
    let query = query.trim();
    let results = state.search.search(query);
    bot.send_message(msg.chat.id, format_results(query, &results))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_start_registers() {
        let store = Store::open_in_memory();
        let outcome = register_user(&store, 42, "Ana", Some("ana")).unwrap();
        assert_eq!(outcome, RegistrationOutcome::Registered);

        let user = store.find_user(42).unwrap().unwrap();
        assert_eq!(user.first_name, "Ana");
        assert_eq!(user.phone_number, None);
        assert_eq!(store.user_count(), 1);
    }

    #[test]
    fn test_second_start_reports_already_registered() {
        let store = Store::open_in_memory();
        register_user(&store, 42, "Ana", Some("ana")).unwrap();

        let outcome = register_user(&store, 42, "Ana", Some("ana")).unwrap();
        assert_eq!(outcome, RegistrationOutcome::AlreadyRegistered);
        assert_eq!(store.user_count(), 1);
    }

    #[test]
    fn test_registration_is_per_chat_id() {
        let store = Store::open_in_memory();
        register_user(&store, 42, "Ana", Some("ana")).unwrap();
        let outcome = register_user(&store, 43, "Bo", None).unwrap();
        assert_eq!(outcome, RegistrationOutcome::Registered);
        assert_eq!(store.user_count(), 2);
    }

    #[test]
    fn test_contact_keyboard_requests_contact() {
        let json = serde_json::to_string(&contact_keyboard()).unwrap();
        assert!(json.contains("Share phone number"));
        assert!(json.contains(r#""request_contact":true"#));
        assert!(json.contains(r#""one_time_keyboard":true"#));
    }

    #[test]
    fn test_contact_ack_addresses_sender() {
        assert_eq!(
            contact_ack("Ana"),
            "Thank you, Ana! Your phone number has been registered."
        );
    }

    #[test]
    fn test_is_plain_text() {
        assert!(is_plain_text("hello there"));
        assert!(!is_plain_text("/start"));
        assert!(!is_plain_text("/websearch rust"));
    }

    #[test]
    fn test_exchange_recorded_when_enabled() {
        let store = Store::open_in_memory();
        record_exchange(&store, true, 42, "hello", "hi there");
        assert_eq!(store.chat_history_count(), 1);
    }

    #[test]
    fn test_exchange_not_recorded_when_disabled() {
        let store = Store::open_in_memory();
        record_exchange(&store, false, 42, "hello", "hi there");
        assert_eq!(store.chat_history_count(), 0);
    }

    #[tokio::test]
    async fn test_media_sequence_records_each_attachment_in_order() {
        let store = Store::open_in_memory();
        let delivered = relay_attachments(&store, 42, "photo", 3, |index| async move {
            Ok(format!("downloads/42_file_{index}.jpg"))
        })
        .await;

        assert_eq!(delivered, 3);
        let expected: Vec<String> = (0..3)
            .map(|i| format!("downloads/42_file_{i}.jpg"))
            .collect();
        assert_eq!(store.file_paths(), expected);
    }

    #[tokio::test]
    async fn test_media_failure_skips_remaining_attachments() {
        let store = Store::open_in_memory();
        let attempts = std::cell::RefCell::new(Vec::new());

        let delivered = relay_attachments(&store, 42, "photo", 4, |index| {
            attempts.borrow_mut().push(index);
            async move {
                if index == 2 {
                    Err("download failed".to_string())
                } else {
                    Ok(format!("downloads/42_file_{index}.jpg"))
                }
            }
        })
        .await;

        // Attachments before the failure are done and recorded
        assert_eq!(delivered, 2);
        assert_eq!(store.file_record_count(), 2);
        // The one after the failure is never attempted
        assert_eq!(*attempts.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn test_local_file_name() {
        assert_eq!(local_file_name("photos/file_42.jpg", 42), "42_file_42.jpg");
        assert_eq!(local_file_name("", 7), "7_attachment.bin");
    }

    #[test]
    fn test_command_parsing() {
        let cmd = Command::parse("/start", "gembot").unwrap();
        assert!(matches!(cmd, Command::Start));

        let cmd = Command::parse("/websearch rust telegram bots", "gembot").unwrap();
        match cmd {
            Command::Websearch(query) => assert_eq!(query, "rust telegram bots"),
            _ => panic!("expected websearch command"),
        }
    }

    #[test]
    fn test_unknown_command_does_not_parse() {
        assert!(Command::parse("/frobnicate", "gembot").is_err());
        assert!(Command::parse("plain text", "gembot").is_err());
    }
}

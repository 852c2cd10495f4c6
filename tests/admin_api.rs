//! Integration tests for the admin REST surface and the chat command
//! handler.
//!
//! Each test builds a service context over an in-memory store, spins up the
//! Axum router on a random port and exercises the real HTTP contract.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use serde_json::Value;
use tokio::net::TcpListener;

use save_restricted_bot::api::admin_routes;
use save_restricted_bot::clock::SystemClock;
use save_restricted_bot::commands::{CommandHandler, Sender, parse_command};
use save_restricted_bot::config::{
    AdminApiConfig, BackupConfig, BotConfig, QueueConfig, TelegramConfig,
};
use save_restricted_bot::context::ServiceContext;
use save_restricted_bot::error::PlatformError;
use save_restricted_bot::platform::{BotApiConnector, Deliverer, ItemMetadata};
use save_restricted_bot::queue::{ChatRef, SourceRef, TaskState};
use save_restricted_bot::store::{LibSqlBackend, SessionStore};
use save_restricted_bot::vault::CredentialVault;

const ADMIN: i64 = 1;
const USER: i64 = 2;
const TOKEN: &str = "s3cret";

struct NullDeliverer;

#[async_trait]
impl Deliverer for NullDeliverer {
    async fn deliver(
        &self,
        _chat_id: i64,
        _item: &ItemMetadata,
        _bytes: Vec<u8>,
    ) -> Result<(), PlatformError> {
        Ok(())
    }
}

fn config(backup_dir: PathBuf, token: Option<&str>) -> BotConfig {
    BotConfig {
        telegram: TelegramConfig {
            bot_token: SecretString::from("123:ABC"),
            allowed_users: vec!["*".into()],
            admins: vec![ADMIN],
            dump_chat_id: None,
        },
        queue: QueueConfig::default(),
        admin_api: AdminApiConfig {
            addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            token: token.map(SecretString::from),
        },
        backup: BackupConfig {
            dir: backup_dir,
            ..BackupConfig::default()
        },
        db_path: PathBuf::from(":memory:"),
        log_dir: PathBuf::from("logs"),
        encryption_key: None,
    }
}

/// Build a context whose queue is never started, so tasks stay put.
async fn context(backup_dir: PathBuf, token: Option<&str>) -> Arc<ServiceContext> {
    let backend = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let sessions: Arc<dyn SessionStore> = backend.clone();
    let vault = CredentialVault::new(sessions, None);
    Arc::new(ServiceContext::from_parts(
        config(backup_dir, token),
        backend,
        vault,
        Arc::new(BotApiConnector::with_base_url("http://127.0.0.1:9", None)),
        Arc::new(NullDeliverer),
        Arc::new(SystemClock),
    ))
}

/// Start the admin router on a random port, return its base URL.
async fn start_server(ctx: Arc<ServiceContext>) -> String {
    let app = admin_routes(ctx);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;
    format!("http://127.0.0.1:{port}")
}

fn public(message_id: i64) -> SourceRef {
    SourceRef::new(ChatRef::Username("news".into()), message_id)
}

#[tokio::test]
async fn health_needs_no_token_but_admin_routes_do() {
    let dir = tempfile::tempdir().unwrap();
    let base = start_server(context(dir.path().to_path_buf(), Some(TOKEN)).await).await;
    let client = reqwest::Client::new();

    let health = client.get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(health.status(), 200);
    let body: Value = health.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    let denied = client
        .get(format!("{base}/api/admin/stats"))
        .send()
        .await
        .unwrap();
    assert_eq!(denied.status(), 401);

    let wrong = client
        .get(format!("{base}/api/admin/stats"))
        .bearer_auth("nope")
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), 401);

    let allowed = client
        .get(format!("{base}/api/admin/stats"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(allowed.status(), 200);
}

#[tokio::test]
async fn stats_and_listing_reflect_the_queue() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path().to_path_buf(), None).await;
    let first = ctx.engine.enqueue(USER, USER, public(1)).await.unwrap();
    ctx.engine.enqueue(USER, USER, public(2)).await.unwrap();
    ctx.engine.enqueue(USER + 1, USER + 1, public(3)).await.unwrap();
    ctx.engine.cancel(Some(USER), first).await.unwrap();
    let base = start_server(ctx).await;
    let client = reqwest::Client::new();

    let stats: Value = client
        .get(format!("{base}/api/admin/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["total"], 3);
    assert_eq!(stats["by_state"]["pending"], 2);
    assert_eq!(stats["by_state"]["cancelled"], 1);

    let tasks: Vec<Value> = client
        .get(format!("{base}/api/admin/tasks?owner={USER}&state=pending"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0]["source"]["message_id"], 2);

    let bad = client
        .get(format!("{base}/api/admin/tasks?state=sleeping"))
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status(), 400);
}

#[tokio::test]
async fn task_actions_map_errors_to_status_codes() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path().to_path_buf(), None).await;
    let id = ctx.engine.enqueue(USER, USER, public(5)).await.unwrap();
    let base = start_server(Arc::clone(&ctx)).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/api/admin/tasks/{id}/priority"))
        .json(&serde_json::json!({"priority": 9}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(ctx.engine.get(id).await.unwrap().priority, 9);

    // Only failed tasks can be retried.
    let resp = client
        .post(format!("{base}/api/admin/tasks/{id}/retry"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    let resp = client
        .post(format!("{base}/api/admin/tasks/{id}/cancel"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(ctx.engine.get(id).await.unwrap().state, TaskState::Cancelled);

    let resp = client
        .post(format!("{base}/api/admin/tasks/{id}/cancel"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    let missing = uuid::Uuid::new_v4();
    let resp = client
        .post(format!("{base}/api/admin/tasks/{missing}/cancel"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = client
        .post(format!("{base}/api/admin/tasks/not-a-uuid/cancel"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn pause_resume_and_backup_routes() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path().to_path_buf(), None).await;
    ctx.engine.enqueue(USER, USER, public(6)).await.unwrap();
    let base = start_server(Arc::clone(&ctx)).await;
    let client = reqwest::Client::new();

    let resp: Value = client
        .post(format!("{base}/api/admin/users/{USER}/pause"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["changed"], true);
    assert!(ctx.engine.status(USER).await.unwrap().paused);

    client
        .post(format!("{base}/api/admin/users/{USER}/resume"))
        .send()
        .await
        .unwrap();
    assert!(!ctx.engine.status(USER).await.unwrap().paused);

    let resp = client
        .post(format!("{base}/api/admin/backup"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let backups = ctx.backups.list_backups().await.unwrap();
    assert_eq!(backups.len(), 1);
}

#[tokio::test]
async fn command_handler_enqueues_and_gates_admin_commands() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path().to_path_buf(), None).await;
    let handler = CommandHandler::new(Arc::clone(&ctx));
    let user = Sender {
        user_id: USER,
        chat_id: USER,
    };
    let admin = Sender {
        user_id: ADMIN,
        chat_id: ADMIN,
    };

    let reply = handler
        .handle(user, parse_command("https://t.me/news/10-12").unwrap())
        .await;
    assert!(reply.text.contains("Queued 3"), "{}", reply.text);

    let reply = handler.handle(user, parse_command("/stats").unwrap()).await;
    assert!(reply.text.contains("admins only"));

    let reply = handler.handle(admin, parse_command("/stats").unwrap()).await;
    assert!(!reply.text.contains("admins only"));

    let reply = handler
        .handle(user, parse_command("/login SESSION").unwrap())
        .await;
    assert!(reply.delete_request);
    assert!(reply.text.contains("disabled"), "{}", reply.text);

    let reply = handler
        .handle(user, parse_command("https://t.me/c/123/4").unwrap())
        .await;
    assert!(reply.text.contains("/login"), "{}", reply.text);

    let reply = handler.handle(user, parse_command("/cancel").unwrap()).await;
    assert!(reply.text.contains('3'), "{}", reply.text);
}

#[tokio::test]
async fn delivery_settings_commands_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path().to_path_buf(), None).await;
    let handler = CommandHandler::new(Arc::clone(&ctx));
    let user = Sender {
        user_id: USER,
        chat_id: USER,
    };

    let reply = handler
        .handle(user, parse_command("/setchat -100555").unwrap())
        .await;
    assert!(reply.text.contains("-100555"), "{}", reply.text);
    let reply = handler
        .handle(user, parse_command("/filters video off").unwrap())
        .await;
    assert!(reply.text.contains("🚫 video"), "{}", reply.text);

    let id = ctx.engine.enqueue(USER, USER, public(8)).await.unwrap();
    let task = ctx.engine.get(id).await.unwrap();
    assert_eq!(task.chat_id, USER);
    assert_eq!(task.delivery_chat(), -100555);

    let reply = handler.handle(user, parse_command("/filters").unwrap()).await;
    assert!(reply.text.contains("🚫 video"), "{}", reply.text);
    assert!(reply.text.contains("✅ photo"), "{}", reply.text);
    assert!(reply.text.contains("Delivering to chat -100555"), "{}", reply.text);

    handler
        .handle(user, parse_command("/setchat off").unwrap())
        .await;
    let settings = ctx.engine.settings(USER).await.unwrap();
    assert_eq!(settings.target_chat, None);
    assert_eq!(settings.skipped.len(), 1);

    let reply = handler
        .handle(user, parse_command("/filters video sometimes").unwrap())
        .await;
    assert!(reply.text.starts_with("Usage:"), "{}", reply.text);
}

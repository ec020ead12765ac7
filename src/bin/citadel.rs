use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use citadel::chat::{InMemoryConnector, InboundChat};
use citadel::config::{AppConfig, ConfigManager};
use citadel::moderation::{plan_actions, SenderFlags};
use citadel::platform::{DryRunModerationApi, HelixClient, StreamStatusProvider};
use citadel::{
    logging, ActionExecutor, ChannelName, ChatMessage, Classifier, Credentials, ModerationApi,
    RuleBasedClassifier, SessionDeps, SessionRegistry, SessionStats, SessionStatus,
    TelemetryBroadcaster, TelemetryEvent, TelemetryServer, TwitchConnector,
};

#[derive(Parser)]
#[command(author, version, about = "AI chat moderator for Twitch", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Moderate one or more live channels until Ctrl-C
    Run {
        /// Channel to moderate (repeatable)
        #[arg(short = 'C', long = "channel", required = true)]
        channels: Vec<String>,

        /// OAuth token of the bot account
        #[arg(long, env = "TWITCH_TOKEN", hide_env_values = true)]
        token: String,

        /// Helix client id (overrides the config file)
        #[arg(long, env = "TWITCH_CLIENT_ID")]
        client_id: Option<String>,

        /// Log moderation actions instead of calling the platform
        #[arg(long)]
        dry_run: bool,

        /// Telemetry WebSocket port (overrides the config file)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Classify a single message and print the verdict as JSON
    Classify {
        /// Message text
        text: String,

        #[arg(long, default_value = "viewer")]
        username: String,

        /// Treat the sender as a moderator
        #[arg(long)]
        moderator: bool,

        /// Treat the sender as a subscriber
        #[arg(long)]
        subscriber: bool,
    },
    /// Run a chat log ("username: message" per line) through a dry-run session
    Replay {
        file: PathBuf,

        #[arg(long, default_value = "replay")]
        channel: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_manager = match &cli.config {
        Some(path) => ConfigManager::with_path(path),
        None => ConfigManager::new()?,
    };
    let mut config = config_manager.load_config()?;
    if cli.verbose {
        config.log.log_level = "debug".to_string();
    }

    // tokio-consoleの初期化（プロファイリング用）
    #[cfg(feature = "debug-tokio")]
    console_subscriber::init();

    #[cfg(not(feature = "debug-tokio"))]
    let _log_guard = logging::init_logging(&config.log)?;

    match cli.command {
        Commands::Run {
            channels,
            token,
            client_id,
            dry_run,
            port,
        } => run(config, channels, token, client_id, dry_run, port).await,
        Commands::Classify {
            text,
            username,
            moderator,
            subscriber,
        } => classify(&config, text, username, moderator, subscriber),
        Commands::Replay { file, channel } => replay(&config, file, channel).await,
    }
}

fn build_classifier(config: &AppConfig) -> anyhow::Result<RuleBasedClassifier> {
    RuleBasedClassifier::with_extra_terms(
        config.moderation.exemptions.clone(),
        &config.moderation.extra_banned_words,
    )
    .context("Invalid banned word list")
}

fn dry_run_api() -> Arc<dyn ModerationApi> {
    Arc::new(DryRunModerationApi::new())
}

async fn run(
    config: AppConfig,
    channels: Vec<String>,
    token: String,
    client_id: Option<String>,
    dry_run: bool,
    port: Option<u16>,
) -> anyhow::Result<()> {
    tracing::info!("🛡️ Starting citadel moderator");

    let classifier = Arc::new(build_classifier(&config)?);
    let client_id = client_id.or_else(|| config.bot.client_id.clone());

    let (api, stream_status): (Arc<dyn ModerationApi>, Option<Arc<dyn StreamStatusProvider>>) =
        match client_id {
            Some(client_id) if !dry_run => {
                let helix = Arc::new(HelixClient::new(
                    client_id,
                    token.clone(),
                    config.bot.login.clone(),
                    config.moderation.action_timeout(),
                )?);
                let api: Arc<dyn ModerationApi> = helix.clone();
                let provider: Arc<dyn StreamStatusProvider> = helix;
                (api, Some(provider))
            }
            Some(_) => (dry_run_api(), None),
            None => {
                tracing::warn!("⚠️ No Helix client id configured, moderation actions run in dry-run mode");
                (dry_run_api(), None)
            }
        };

    let broadcaster = TelemetryBroadcaster::new(config.telemetry.channel_capacity);
    let registry = Arc::new(SessionRegistry::new(SessionDeps {
        connector: Arc::new(TwitchConnector::new(config.reconnect.clone())),
        classifier,
        executor: ActionExecutor::with_timeout(api, config.moderation.action_timeout()),
        broadcaster: broadcaster.clone(),
        stream_status,
        stats_interval: config.telemetry.stats_interval(),
    }));

    let server = TelemetryServer::new(
        config.telemetry.websocket_host.clone(),
        port.unwrap_or(config.telemetry.websocket_port),
        broadcaster,
        registry.clone(),
    );
    server.start().await?;

    let credentials = Credentials::new(config.bot.login.clone(), token);
    let mut started = 0;
    for channel in &channels {
        match registry.start_session(channel.as_str(), &credentials).await {
            Ok(session) => {
                started += 1;
                tracing::info!("📺 Moderating #{} (session {})", session.channel, session.session_id);
            }
            Err(e) => tracing::error!("❌ {}", e),
        }
    }
    if started == 0 {
        server.stop().await;
        anyhow::bail!("No channel could be joined");
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("🛑 Shutdown signal received");

    registry.shutdown_all().await;
    server.stop().await;
    tracing::info!("👋 citadel shutting down");
    Ok(())
}

fn classify(
    config: &AppConfig,
    text: String,
    username: String,
    moderator: bool,
    subscriber: bool,
) -> anyhow::Result<()> {
    let classifier = build_classifier(config)?;

    let mut badges = BTreeSet::new();
    if moderator {
        badges.insert("moderator".to_string());
    }
    if subscriber {
        badges.insert("subscriber".to_string());
    }
    let message = ChatMessage {
        id: "cli-1".to_string(),
        platform_id: false,
        channel: ChannelName::new("cli"),
        username,
        text,
        received_at: Utc::now(),
        sender: SenderFlags {
            is_moderator: moderator,
            is_subscriber: subscriber,
        },
        badges,
    };

    let verdict = classifier.classify(&message);
    let output = serde_json::json!({
        "verdict": verdict,
        "severity": verdict.severity(),
        "actions": plan_actions(&message, &verdict),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// 1メッセージの処理で流れるイベント数の上限
const EVENTS_PER_MESSAGE: usize = 4;

/// "username: message" 形式の1行を読む
fn parse_log_line(line: &str) -> Option<InboundChat> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let (username, text) = line.split_once(':')?;
    let username = username.trim();
    (!username.is_empty()).then(|| InboundChat::new(username, text.trim()))
}

/// リプレイ結果
#[derive(Debug)]
struct ReplayReport {
    /// アクションが必要と判定されたメッセージ（到着順）
    flagged: Vec<serde_json::Value>,
    stats: Option<SessionStats>,
}

async fn replay(config: &AppConfig, file: PathBuf, channel: String) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(&file)
        .with_context(|| format!("Failed to read chat log: {}", file.display()))?;
    tracing::info!("📼 Replaying chat log {}", file.display());

    let report = replay_log(config, &content, ChannelName::new(channel)).await?;
    for line in &report.flagged {
        println!("{}", serde_json::to_string(line)?);
    }
    if let Some(stats) = report.stats {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    }
    Ok(())
}

/// チャットログをドライランのセッションに流して結果を集める
async fn replay_log(
    config: &AppConfig,
    content: &str,
    channel: ChannelName,
) -> anyhow::Result<ReplayReport> {
    let chats: Vec<InboundChat> = content.lines().filter_map(parse_log_line).collect();

    // 全メッセージ分のイベントを取りこぼさずに保持できる容量
    let capacity = (chats.len() * EVENTS_PER_MESSAGE + 16).max(config.telemetry.channel_capacity);

    let connector = InMemoryConnector::new();
    let feed = connector.feed(channel.clone());
    let registry = SessionRegistry::new(SessionDeps {
        connector: Arc::new(connector),
        classifier: Arc::new(build_classifier(config)?),
        executor: ActionExecutor::new(Arc::new(DryRunModerationApi::new())),
        broadcaster: TelemetryBroadcaster::new(capacity),
        stream_status: None,
        // 定期スナップショットは不要
        stats_interval: Duration::from_secs(24 * 60 * 60),
    });
    let mut observer = registry.subscribe();

    let credentials = Credentials::new(config.bot.login.clone(), "replay");
    registry.start_session(channel.clone(), &credentials).await?;

    for chat in chats {
        feed.send(chat);
    }
    feed.close();

    let mut flagged = Vec::new();
    let mut final_stats = None;
    while let Some(event) = observer.recv().await {
        match event {
            TelemetryEvent::ChatEvent {
                message,
                verdict: Some(verdict),
                ..
            } if verdict.requires_action() => {
                flagged.push(serde_json::json!({
                    "username": message.username,
                    "text": message.text,
                    "verdict": verdict,
                }));
            }
            // 接続終了時に最後のスナップショットが流れる
            TelemetryEvent::StatsSnapshot {
                status: SessionStatus::Stopped,
                stats,
                ..
            } => {
                final_stats = Some(stats);
                break;
            }
            _ => {}
        }
    }

    if observer.dropped() > 0 {
        anyhow::bail!(
            "Replay output is incomplete: {} telemetry events were dropped",
            observer.dropped()
        );
    }

    Ok(ReplayReport {
        flagged,
        stats: final_stats.or_else(|| registry.get_stats(channel).ok()),
    })
}

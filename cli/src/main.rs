use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use huddle_core::{
    load_app_config, AppConfig, Collaborators, ConversationObserver, ConversationView, HuddleApp,
};

#[derive(Parser)]
#[command(name = "huddle", version, about = "Live typing and unread state from a presence socket")]
struct Cli {
    /// Directory holding huddle_config.json.
    #[arg(long, env = "HUDDLE_DATA_DIR", default_value = ".")]
    data_dir: PathBuf,

    /// Emit JSON lines instead of text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Subscribe to conversations and print every view change until Ctrl-C.
    Watch {
        /// Our own peer id; our typing and read events are filtered by it.
        #[arg(long, env = "HUDDLE_USER_ID")]
        user: String,

        #[arg(long)]
        socket_url: Option<String>,

        #[arg(long)]
        api_url: Option<String>,

        #[arg(required = true)]
        conversations: Vec<String>,
    },
    /// Print the effective configuration.
    Config,
}

struct Printer {
    json: bool,
}

impl ConversationObserver for Printer {
    fn on_change(&self, view: ConversationView) {
        if self.json {
            match serde_json::to_string(&view) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::warn!(%e, "failed to encode view"),
            }
            return;
        }
        let typing = if view.typing_peers.is_empty() {
            "-".to_string()
        } else {
            view.typing_peers.join(",")
        };
        println!(
            "{:<24} {:<12} unread={:<4} typing={}",
            view.conversation_id,
            format!("{:?}", view.connection),
            view.unread_count,
            typing
        );
    }
}

fn main() -> anyhow::Result<()> {
    huddle_core::logging::init_logging();
    let cli = Cli::parse();
    let data_dir = cli.data_dir.to_string_lossy().to_string();
    let mut config = load_app_config(&data_dir);

    match cli.cmd {
        Command::Config => print_config(&config, cli.json),
        Command::Watch {
            user,
            socket_url,
            api_url,
            conversations,
        } => {
            if socket_url.is_some() {
                config.socket_url = socket_url;
            }
            if api_url.is_some() {
                config.api_base_url = api_url;
            }
            if !config.network_disabled() && config.socket_url().is_none() {
                anyhow::bail!("no usable socket url; pass --socket-url or set HUDDLE_SOCKET_URL");
            }
            watch(config, user, conversations, cli.json)
        }
    }
}

fn watch(
    config: AppConfig,
    user: String,
    conversations: Vec<String>,
    json: bool,
) -> anyhow::Result<()> {
    tracing::info!(user = %user, conversations = ?conversations, "watching");
    let collaborators = Collaborators::from_config(&config);
    let app = HuddleApp::with_collaborators(config, user, collaborators);

    let printer: Arc<dyn ConversationObserver> = Arc::new(Printer { json });
    let subscriptions: Vec<_> = conversations
        .iter()
        .map(|id| app.subscribe(id.clone(), printer.clone()))
        .collect();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build signal runtime")?;
    rt.block_on(tokio::signal::ctrl_c())
        .context("wait for ctrl-c")?;

    drop(subscriptions);
    app.shutdown();
    Ok(())
}

fn print_config(config: &AppConfig, json: bool) -> anyhow::Result<()> {
    let backoff = config.backoff_policy();
    let socket = config.socket_timeouts();
    let effective = serde_json::json!({
        "socket_url": config.socket_url(),
        "api_base_url": config.api_base_url(),
        "network_disabled": config.network_disabled(),
        "typing_timeout_ms": config.typing_timeout_ms(),
        "typing_resend_ms": config.typing_resend_ms(),
        "local_typing_idle_ms": config.local_typing_idle_ms(),
        "reconcile_interval_ms": config.reconcile_interval().as_millis() as u64,
        "backoff_base_ms": backoff.base.as_millis() as u64,
        "backoff_cap_ms": backoff.cap.as_millis() as u64,
        "max_reconnect_attempts": config.max_reconnect_attempts(),
        "eviction_grace_ms": config.eviction_grace().as_millis() as u64,
        "connect_timeout_ms": socket.connect.as_millis() as u64,
        "ping_interval_ms": socket.ping_interval.as_millis() as u64,
        "idle_timeout_ms": socket.idle.as_millis() as u64,
    });
    let out = if json {
        serde_json::to_string(&effective)?
    } else {
        serde_json::to_string_pretty(&effective)?
    };
    println!("{out}");
    Ok(())
}

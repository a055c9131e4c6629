use std::{io::Write, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use studiochat_core_sdk::prelude::*;
use studiochat_core_sdk::{server, telemetry};

/**
 * \brief CLI 程序入口：凭据管理、会话管理、流式对话与本地分发服务。
 */
#[derive(Parser, Debug)]
#[command(name = "studiochat", version, about = "StudioChat streaming chat client")]
struct Cli {
    /** \brief 覆盖 STUDIOCHAT_DB */
    #[arg(long, global = true)]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 管理 Provider 凭据。
     */
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },

    /**
     * \brief 管理会话并发送消息。
     */
    Chat {
        #[command(subcommand)]
        action: ChatAction,
    },

    /**
     * \brief 启动本地 HTTP 分发服务。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:5173")]
        addr: String,
    },

    /**
     * \brief 开关本地日志。
     */
    Telemetry { state: Toggle },
}

#[derive(Subcommand, Debug)]
enum KeyAction {
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        provider: String,
        #[arg(long)]
        secret: String,
        #[arg(long, default_value_t = false)]
        default: bool,
    },
    List,
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        secret: Option<String>,
    },
    Remove {
        id: String,
    },
    Default {
        id: String,
    },
}

#[derive(Subcommand, Debug)]
enum ChatAction {
    New {
        #[arg(long)]
        title: Option<String>,
    },
    List,
    Show {
        id: String,
    },
    Rename {
        id: String,
        #[arg(long)]
        title: String,
    },
    Delete {
        id: String,
    },
    /**
     * \brief 为会话选择凭据。
     */
    UseKey {
        id: String,
        #[arg(long)]
        key: String,
    },
    /**
     * \brief 发送一条用户消息并流式显示回复；Ctrl-C 取消。
     * \param conversation 会话 id，缺省时新建
     * \param server       分发服务地址，缺省时直连 Provider
     */
    Send {
        #[arg(long)]
        conversation: Option<String>,
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        server: Option<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Toggle {
    On,
    Off,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::from_env();
    if let Some(db) = cli.db {
        settings.db_path = db;
    }

    let store = Store::open(&settings.db_path)
        .with_context(|| format!("open database {} failed", settings.db_path))?;
    telemetry::set_enabled(store.telemetry_enabled().await.unwrap_or(false));

    let result = match cli.command {
        Commands::Key { action } => run_key(&store, action).await,
        Commands::Chat { action } => run_chat(store.clone(), &settings, action).await,
        Commands::Serve { addr } => {
            let dispatcher: Arc<dyn Dispatcher> =
                Arc::new(ProviderDispatcher::new(settings.dispatcher.clone()));
            server::run(&addr, dispatcher).await
        }
        Commands::Telemetry { state } => {
            let enabled = matches!(state, Toggle::On);
            telemetry::set_enabled(enabled);
            println!("Telemetry {}", if enabled { "on" } else { "off" });
            store
                .set_telemetry_enabled(enabled)
                .await
                .context("save telemetry failed")
        }
    };
    store.close();
    result
}

async fn run_key(store: &Store, action: KeyAction) -> Result<()> {
    match action {
        KeyAction::Add {
            name,
            provider,
            secret,
            default,
        } => {
            let mut credential = Credential::new(&name, &provider, &secret);
            credential.is_default = default;
            let saved = store
                .add_credential(credential)
                .await
                .context("save credential failed")?;
            println!("Saved credential id={} ({} | {})", saved.id, saved.name, saved.provider);
        }
        KeyAction::List => {
            for c in store.list_credentials().await.context("load credentials failed")? {
                println!(
                    "{} {} [{}] {} {}",
                    if c.is_default { "*" } else { " " },
                    c.id,
                    c.provider,
                    c.name,
                    mask(&c.secret)
                );
            }
        }
        KeyAction::Update {
            id,
            name,
            provider,
            secret,
        } => {
            let mut credential = store
                .get_credential(&id)
                .await?
                .with_context(|| format!("credential {} not found", id))?;
            if let Some(name) = name {
                credential.name = name;
            }
            if let Some(provider) = provider {
                credential.provider = provider;
            }
            if let Some(secret) = secret {
                credential.secret = secret;
            }
            store
                .update_credential(credential)
                .await
                .context("update credential failed")?;
            println!("Updated credential id={}", id);
        }
        KeyAction::Remove { id } => {
            store
                .delete_credential(&id)
                .await
                .context("delete credential failed")?;
            println!("Removed credential id={}", id);
        }
        KeyAction::Default { id } => {
            store
                .set_default_credential(&id)
                .await
                .context("set default credential failed")?;
            println!("Default credential id={}", id);
        }
    }
    Ok(())
}

async fn run_chat(store: Store, settings: &Settings, action: ChatAction) -> Result<()> {
    let dispatcher: Arc<dyn Dispatcher> = match &action {
        ChatAction::Send {
            server: Some(url), ..
        } => Arc::new(RemoteDispatcher::new(url)),
        _ => Arc::new(ProviderDispatcher::new(settings.dispatcher.clone())),
    };
    let mut session = SessionController::new(store.clone(), dispatcher);

    match action {
        ChatAction::New { title } => {
            let conversation = store
                .create_conversation(title.as_deref())
                .await
                .context("create conversation failed")?;
            println!(
                "Created conversation id={} ({})",
                conversation.id, conversation.title
            );
        }
        ChatAction::List => {
            for c in session.list_conversations().await? {
                let count = store.message_count(&c.id).await.unwrap_or(0);
                println!("{} {} ({} messages, {})", c.id, c.title, count, c.created_at);
            }
        }
        ChatAction::Show { id } => {
            for m in session.get_messages(&id).await? {
                println!("[{}] {}", m.role.as_str(), m.content);
            }
        }
        ChatAction::Rename { id, title } => {
            session.rename_conversation(&id, &title).await?;
            println!("Renamed conversation id={}", id);
        }
        ChatAction::Delete { id } => {
            session.delete_conversation(&id).await?;
            println!("Deleted conversation id={}", id);
        }
        ChatAction::UseKey { id, key } => {
            session.open_conversation(&id).await?;
            session.select_credential(Some(&key)).await?;
            println!("Conversation id={} uses credential id={}", id, key);
        }
        ChatAction::Send {
            conversation,
            prompt,
            ..
        } => send(&mut session, conversation, &prompt).await?,
    }
    Ok(())
}

async fn send(
    session: &mut SessionController,
    conversation: Option<String>,
    prompt: &str,
) -> Result<()> {
    match conversation {
        Some(id) => session.open_conversation(&id).await?,
        None => {
            let created = session.new_conversation().await?;
            println!("Created conversation id={}", created.id);
        }
    }
    session.submit(prompt).await?;
    telemetry::log_event(
        "cli.chat",
        &format!(
            "send conversation={} prompt_len={}",
            session.active().map(|c| c.id.as_str()).unwrap_or("-"),
            prompt.len()
        ),
    );

    if let Some(cancel) = session.cancel_token() {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let mut printed = 0;
    let outcome = loop {
        let progress = session.pump().await;
        if progress != Progress::Delta {
            break progress;
        }
        if let Some(reply) = session.messages().last() {
            print!("{}", &reply.content[printed..]);
            printed = reply.content.len();
            std::io::stdout().flush().ok();
        }
    };
    println!();

    match outcome {
        Progress::Finished => Ok(()),
        Progress::Cancelled => {
            println!("(cancelled)");
            Ok(())
        }
        _ => bail!(
            "{}",
            session.last_error().unwrap_or("stream failed").to_string()
        ),
    }
}

fn mask(secret: &str) -> String {
    let tail: String = secret
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("****{}", tail)
}

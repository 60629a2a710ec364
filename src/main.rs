use std::io;
use std::sync::Arc;

use clap::{CommandFactory, Parser};
use colored::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use common_coding_room::channel::WsConnector;
use common_coding_room::cli::{Args, Command};
use common_coding_room::config::AppConfig;
use common_coding_room::console::{self, ConsoleCommand};
use common_coding_room::execution::{ExecutionGateway, Executor, OutputPanel};
use common_coding_room::identity::{Identity, IdentityStore};
use common_coding_room::lobby::{Admission, LobbyClient};
use common_coding_room::protocol::ServerEvent;
use common_coding_room::server::RoomServer;
use common_coding_room::session::{RoomSession, RunRequest, SessionUpdate};
use common_coding_room::{Language, Result};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("common_coding_room=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("{} {}", "error:".bright_red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = AppConfig::load(args.config.as_deref())?;
    let identities = IdentityStore::new(config.client.identity_path());

    match args.command {
        Command::Serve { host, port } => {
            let mut server_config = config.server.clone();
            if let Some(h) = host {
                server_config.host = h;
            }
            if let Some(p) = port {
                server_config.port = p;
            }
            serve(server_config).await
        }
        Command::Create { username } => {
            let username = resolve_username(username, &identities)?;
            let lobby = LobbyClient::new(&config.client.server_url, config.client.request_timeout());
            let admission = lobby.create_and_join(&username).await?;
            println!(
                "{} {}",
                "Room created:".bright_green().bold(),
                admission.room_id.bright_green()
            );
            admit(&config, &identities, admission).await
        }
        Command::Join { room, username } => {
            let username = resolve_username(username, &identities)?;
            let lobby = LobbyClient::new(&config.client.server_url, config.client.request_timeout());
            let admission = lobby.join_existing(&username, &room).await?;
            admit(&config, &identities, admission).await
        }
        Command::Enter { room } => match identities.load()? {
            Some(identity) => run_room(&config, room, identity).await,
            None => {
                println!(
                    "{}",
                    format!(
                        "No saved username. Join first: common-room join {} --username <name>",
                        room
                    )
                    .bright_yellow()
                );
                Ok(())
            }
        },
        Command::Run { file, language } => run_file(&config, &file, language).await,
        Command::Completions { shell } => {
            clap_complete::generate(shell, &mut Args::command(), "common-room", &mut io::stdout());
            Ok(())
        }
    }
}

fn resolve_username(flag: Option<String>, identities: &IdentityStore) -> Result<String> {
    match flag {
        Some(u) => Ok(u),
        None => Ok(identities
            .load()?
            .map(Identity::into_string)
            .unwrap_or_default()),
    }
}

async fn admit(config: &AppConfig, identities: &IdentityStore, admission: Admission) -> Result<()> {
    if let Err(e) = identities.save(&admission.identity) {
        warn!(error = %e, path = %identities.path().display(), "could not persist username");
    }
    run_room(config, admission.room_id, admission.identity).await
}

async fn serve(server_config: common_coding_room::config::ServerConfig) -> Result<()> {
    let server = RoomServer::bind(server_config).await?;
    eprintln!(
        "{}",
        format!("  Room service running at http://{}", server.local_addr()?).bright_green()
    );
    eprintln!("{}", "  Press Ctrl+C to stop.".bright_blue());
    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}

async fn run_file(config: &AppConfig, file: &std::path::Path, language: Language) -> Result<()> {
    let code = tokio::fs::read_to_string(file).await?;
    let gateway = ExecutionGateway::builder(&config.client.execute_url)
        .request_timeout(config.client.request_timeout())
        .build();
    eprintln!(
        "{}",
        format!("  Running {} as {} {}", file.display(), language.label(), language.runtime_version())
            .bright_blue()
    );
    let outcome = gateway.execute(&code, language).await;
    let panel = OutputPanel::from_outcome(&outcome);
    println!("{}", console::render_output(&panel));
    if panel.failed {
        std::process::exit(1);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Interactive room
// ---------------------------------------------------------------------------

async fn run_room(config: &AppConfig, room_id: String, identity: Identity) -> Result<()> {
    let executor: Arc<dyn Executor> = Arc::new(
        ExecutionGateway::builder(&config.client.execute_url)
            .request_timeout(config.client.request_timeout())
            .build(),
    );
    let mut session = RoomSession::builder(room_id)
        .identity(Some(identity))
        .connector(Arc::new(WsConnector::with_origin(&config.client.origin)))
        .channel_config(config.client.channel_config())
        .executor(executor)
        .build();
    session.enter()?;
    println!("{}", console::HELP.bright_black());

    let mut printed_chat = 0usize;
    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());

    loop {
        tokio::select! {
            update = session.next_update() => {
                match update {
                    Some(u) => render_update(&session, &u, &mut printed_chat),
                    None => break,
                }
            }
            line = lines.next() => {
                match line {
                    Some(Ok(line)) => {
                        if !handle_line(&mut session, &line).await {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "stdin read failed");
                        session.leave().await;
                        break;
                    }
                    None => {
                        session.leave().await;
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                session.leave().await;
                break;
            }
        }
    }
    println!("{}", "Left the room.".bright_blue());
    Ok(())
}

fn render_update(session: &RoomSession, update: &SessionUpdate, printed_chat: &mut usize) {
    let Some(view) = session.view() else {
        return;
    };
    match update {
        SessionUpdate::Status(_) => println!("{}", console::render_header(&view)),
        SessionUpdate::Room(ServerEvent::InitialState(_)) => {
            println!("{}", console::render_participants(&view));
            println!("{}", console::render_code(&view));
        }
        SessionUpdate::Room(ServerEvent::CodeUpdated { username, .. }) => {
            if username != &view.local_username {
                println!("{}", format!("~ {} edited the code", username).bright_black());
            }
        }
        SessionUpdate::Room(ServerEvent::LanguageUpdated { language, username }) => {
            if username != &view.local_username {
                println!(
                    "{}",
                    format!("~ {} switched the language to {}", username, language.label()).bright_yellow()
                );
            }
        }
        SessionUpdate::Room(_) => {}
        SessionUpdate::Output(panel) => println!("{}", console::render_output(panel)),
        SessionUpdate::Ignored => debug!("update ignored"),
    }
    for line in view.chat.iter().skip(*printed_chat) {
        println!("{}", console::render_chat_line(line));
    }
    *printed_chat = view.chat.len();
}

/// Returns `false` when the user left the room.
async fn handle_line(session: &mut RoomSession, line: &str) -> bool {
    let command = match console::parse_input(line) {
        Ok(Some(c)) => c,
        Ok(None) => return true,
        Err(msg) => {
            println!("{}", msg.bright_red());
            return true;
        }
    };

    match command {
        ConsoleCommand::Chat(text) => {
            if !session.send_chat(&text) {
                println!("{}", "Not connected; message not sent.".bright_red());
            }
        }
        ConsoleCommand::Run => match session.run_code() {
            Ok(RunRequest::Started { .. }) => println!("{}", "Running...".bright_blue()),
            Ok(RunRequest::AlreadyRunning) => println!("{}", "Already running.".bright_yellow()),
            Err(e) => println!("{}", e.to_string().bright_red()),
        },
        ConsoleCommand::Language(language) => {
            session.select_language(language);
            if let Some(view) = session.view() {
                println!("{}", console::render_code(&view));
            }
        }
        ConsoleCommand::Load(path) => match tokio::fs::read_to_string(&path).await {
            Ok(code) => {
                session.edit_code(code);
                println!("{}", format!("Loaded {}", path.display()).bright_green());
            }
            Err(e) => println!("{}", format!("Cannot read {}: {}", path.display(), e).bright_red()),
        },
        ConsoleCommand::ShowCode => {
            if let Some(view) = session.view() {
                println!("{}", console::render_code(&view));
            }
        }
        ConsoleCommand::Who => {
            if let Some(view) = session.view() {
                println!("{}", console::render_header(&view));
                println!("{}", console::render_participants(&view));
            }
        }
        ConsoleCommand::Help => println!("{}", console::HELP),
        ConsoleCommand::Leave => {
            session.leave().await;
            return false;
        }
    }
    true
}

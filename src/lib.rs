pub mod commands;
pub mod crypto;
pub mod error;
pub mod services;

use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use commands::Command;
use error::Result;
use services::chat_api::parse_base_url;
use services::{
    ChatSession, ChatSettings, HttpChatApi, HttpFaceVerifier, SessionCommand, SessionDeps,
    SocketIoTransport,
};

fn init_logging(settings: &ChatSettings) {
    let _ = env_logger::Builder::new()
        .filter_level(settings.log_filter())
        .filter_module("tungstenite", log::LevelFilter::Warn)
        .filter_module("tokio_tungstenite", log::LevelFilter::Warn)
        .filter_module("reqwest", log::LevelFilter::Warn)
        .filter_module("hyper", log::LevelFilter::Warn)
        .filter_module("hyper_util", log::LevelFilter::Warn)
        .parse_default_env()
        .try_init();
}

/// Run the terminal client until `/quit` or end of input.
pub async fn run() -> Result<()> {
    let settings = ChatSettings::load()?;
    init_logging(&settings);

    let api = Arc::new(HttpChatApi::new(
        &settings.server_url,
        settings.request_timeout(),
        settings.session_cookie.clone(),
    )?);
    let verifier = Arc::new(HttpFaceVerifier::new(
        &settings.server_url,
        settings.effective_username(),
        settings.request_timeout(),
        settings.session_cookie.clone(),
    )?);
    let push = if settings.push_enabled {
        let base = parse_base_url(&settings.server_url)?;
        Some(SocketIoTransport::connect(&base, settings.session_cookie.clone())?)
    } else {
        None
    };

    let (session, mut view) = ChatSession::start(
        &settings,
        SessionDeps {
            api,
            push,
            verifier,
        },
    )
    .await?;

    log::info!(
        "Chatting with {} on {} (type /help)",
        settings.recipient_id,
        settings.server_url
    );

    tokio::spawn(async move {
        while let Some(update) = view.recv().await {
            println!("{}", commands::render_update(&update));
        }
    });

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let input = tokio::spawn(read_input(settings, command_tx));
    session.run(command_rx).await;
    input.abort();
    Ok(())
}

async fn read_input(settings: ChatSettings, commands_tx: mpsc::UnboundedSender<SessionCommand>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                log::error!("Failed to read input: {}", e);
                break;
            }
        };

        let command = match commands::parse_command(&line) {
            Ok(Some(Command::Help)) => {
                println!("{}", commands::HELP);
                continue;
            }
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                eprintln!("{}", e);
                continue;
            }
        };
        let quitting = command == Command::Quit;

        match commands::to_session_command(command, &settings) {
            Ok(Some(session_command)) => {
                if commands_tx.send(session_command).is_err() {
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => eprintln!("{}", e),
        }
        if quitting {
            return;
        }
    }
    let _ = commands_tx.send(SessionCommand::Shutdown);
}

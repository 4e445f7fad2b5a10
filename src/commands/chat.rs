use std::path::PathBuf;

use crate::error::{ChatError, Result};
use crate::services::chat_service::{SendRequest, SessionCommand};
use crate::services::chat_types::*;
use crate::services::config::ChatSettings;
use crate::services::face_verifier::image_data_url;

pub const HELP: &str = "\
  <text>                 send (encryption per config)
  /locked <text>         send a face-locked message
  /plain <text>          send without encryption
  /attach <path> [text]  send a file
  /unlock <id> [image]   verify your face and reveal a locked message
  /retry <temp-id>       resend a failed message
  /history               reload the conversation
  /quit                  leave";

// ── Parsing ───────────────────────────────────────────────────

/// A line typed by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send {
        text: String,
        face_locked: Option<bool>,
        encrypted: Option<bool>,
    },
    Attach {
        path: PathBuf,
        text: String,
    },
    Unlock {
        id: MessageId,
        image: Option<PathBuf>,
    },
    Retry(TempId),
    History,
    Help,
    Quit,
}

/// Parse one input line. Blank lines yield `None`.
pub fn parse_command(line: &str) -> Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    if !line.starts_with('/') {
        return Ok(Some(Command::Send {
            text: line.to_string(),
            face_locked: None,
            encrypted: None,
        }));
    }

    let (name, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    let command = match name {
        "/locked" => Command::Send {
            text: require(rest, "/locked <text>")?.to_string(),
            face_locked: Some(true),
            encrypted: None,
        },
        "/plain" => Command::Send {
            text: require(rest, "/plain <text>")?.to_string(),
            face_locked: None,
            encrypted: Some(false),
        },
        "/attach" => {
            let (path, text) = split_first(require(rest, "/attach <path> [text]")?);
            Command::Attach {
                path: PathBuf::from(path),
                text: text.to_string(),
            }
        }
        "/unlock" => {
            let (id, image) = split_first(require(rest, "/unlock <id> [image]")?);
            Command::Unlock {
                id: MessageId::from(id),
                image: (!image.is_empty()).then(|| PathBuf::from(image)),
            }
        }
        "/retry" => Command::Retry(TempId::new(require(rest, "/retry <temp-id>")?)),
        "/history" => Command::History,
        "/help" => Command::Help,
        "/quit" | "/exit" => Command::Quit,
        other => {
            return Err(ChatError::InvalidInput(format!(
                "unknown command {} (try /help)",
                other
            )))
        }
    };
    Ok(Some(command))
}

fn require<'a>(rest: &'a str, usage: &str) -> Result<&'a str> {
    if rest.is_empty() {
        Err(ChatError::InvalidInput(format!("usage: {}", usage)))
    } else {
        Ok(rest)
    }
}

fn split_first(rest: &str) -> (&str, &str) {
    match rest.split_once(char::is_whitespace) {
        Some((first, tail)) => (first, tail.trim()),
        None => (rest, ""),
    }
}

// ── Dispatch ──────────────────────────────────────────────────

/// Turn a parsed command into a session instruction, reading any files it names.
/// `Help` has no session counterpart and yields `None`.
pub fn to_session_command(command: Command, settings: &ChatSettings) -> Result<Option<SessionCommand>> {
    let session_command = match command {
        Command::Send {
            text,
            face_locked,
            encrypted,
        } => SessionCommand::Send(SendRequest {
            text,
            face_locked: face_locked.unwrap_or(settings.face_lock_by_default),
            encrypted: encrypted.unwrap_or(settings.encrypt_by_default),
            attachment: None,
        }),
        Command::Attach { path, text } => SessionCommand::Send(SendRequest {
            text,
            face_locked: settings.face_lock_by_default,
            encrypted: settings.encrypt_by_default,
            attachment: Some(Attachment::from_path(&path)?),
        }),
        Command::Unlock { id, image } => SessionCommand::Unlock {
            id,
            face_image: image.as_deref().map(image_data_url).transpose()?,
        },
        Command::Retry(temp_id) => SessionCommand::Retry(temp_id),
        Command::History => SessionCommand::History,
        Command::Quit => SessionCommand::Shutdown,
        Command::Help => return Ok(None),
    };
    Ok(Some(session_command))
}

// ── Rendering ─────────────────────────────────────────────────

/// One line of terminal output for a view update.
pub fn render_update(update: &ViewUpdate) -> String {
    match update {
        ViewUpdate::Inserted { message, .. } => render_message(message),
        ViewUpdate::Promoted { message, .. } => format!("  ✓ delivered as #{}", record_label(message)),
        ViewUpdate::Revealed { id, body } => format!("[#{}] unlocked: {}", id, body),
        ViewUpdate::UnlockFailed { id, reason } => format!("[#{}] still locked: {}", id, reason),
        ViewUpdate::DeliveryFailed { temp_id, reason } => {
            format!("  ✗ not delivered ({}), /retry {}", reason, temp_id)
        }
        ViewUpdate::ConnectionChanged { connected: true } => "-- live --".to_string(),
        ViewUpdate::ConnectionChanged { connected: false } => {
            "-- connection lost, polling --".to_string()
        }
    }
}

fn record_label(message: &ChatMessage) -> String {
    match &message.key {
        RecordKey::Confirmed(id) => id.to_string(),
        RecordKey::Temp(temp) => temp.to_string(),
    }
}

fn render_message(message: &ChatMessage) -> String {
    let mut line = format!(
        "[#{}] {} {}: {}",
        record_label(message),
        message.timestamp.format("%H:%M"),
        message.sender_label,
        message.body.display()
    );
    if let Some(attachment) = &message.attachment_ref {
        line.push_str(&format!(" 📎 {}", attachment));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("hello there", "hello there", None, None)]
    #[case("/locked see you", "see you", Some(true), None)]
    #[case("/plain  not secret ", "not secret", None, Some(false))]
    fn test_parse_send_variants(
        #[case] line: &str,
        #[case] text: &str,
        #[case] face_locked: Option<bool>,
        #[case] encrypted: Option<bool>,
    ) {
        assert_eq!(
            parse_command(line).unwrap(),
            Some(Command::Send {
                text: text.to_string(),
                face_locked,
                encrypted
            })
        );
    }

    #[test]
    fn test_parse_blank_line() {
        assert_eq!(parse_command("   ").unwrap(), None);
    }

    #[test]
    fn test_parse_unlock_with_and_without_image() {
        assert_eq!(
            parse_command("/unlock 12").unwrap(),
            Some(Command::Unlock {
                id: MessageId::from(12),
                image: None
            })
        );
        assert_eq!(
            parse_command("/unlock 12 me.jpg").unwrap(),
            Some(Command::Unlock {
                id: MessageId::from(12),
                image: Some(PathBuf::from("me.jpg"))
            })
        );
    }

    #[test]
    fn test_parse_attach() {
        assert_eq!(
            parse_command("/attach ./cat.png look at this").unwrap(),
            Some(Command::Attach {
                path: PathBuf::from("./cat.png"),
                text: "look at this".into()
            })
        );
    }

    #[rstest]
    #[case("/locked")]
    #[case("/unlock")]
    #[case("/retry   ")]
    #[case("/shout hi")]
    fn test_parse_rejects(#[case] line: &str) {
        assert!(matches!(parse_command(line), Err(ChatError::InvalidInput(_))));
    }

    #[test]
    fn test_defaults_fill_unspecified_flags() {
        let settings = ChatSettings {
            encrypt_by_default: true,
            face_lock_by_default: true,
            ..Default::default()
        };
        let cmd = parse_command("/plain hi").unwrap().unwrap();
        match to_session_command(cmd, &settings).unwrap() {
            Some(SessionCommand::Send(req)) => {
                assert!(!req.encrypted);
                assert!(req.face_locked);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(to_session_command(Command::Help, &settings).unwrap().is_none());
        assert!(matches!(
            to_session_command(Command::Quit, &settings).unwrap(),
            Some(SessionCommand::Shutdown)
        ));
    }

    #[test]
    fn test_attach_missing_file_fails() {
        let cmd = Command::Attach {
            path: PathBuf::from("/nonexistent/file.bin"),
            text: String::new(),
        };
        assert!(to_session_command(cmd, &ChatSettings::default()).is_err());
    }

    #[test]
    fn test_render_delivery_failed_mentions_retry() {
        let line = render_update(&ViewUpdate::DeliveryFailed {
            temp_id: TempId::new("1700000000000-abc123xyz"),
            reason: "offline".into(),
        });
        assert!(line.contains("/retry 1700000000000-abc123xyz"));
    }
}

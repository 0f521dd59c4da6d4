// Chat input parsing

use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    /// `/dm <user>:<message>`
    Direct { target: String, text: String },
    /// `/file <user> <path>`
    File { target: String, path: PathBuf },
    /// `/get <user>`
    Get { target: String },
    /// `<user>:<message>`, relayed by the directory
    Plain { target: String, text: String },
    Peers,
    Help,
    Exit,
    Empty,
    /// Unparseable input, with a hint for the operator
    Invalid(String),
}

pub fn parse_line(line: &str) -> ChatCommand {
    let line = line.trim();
    if line.is_empty() {
        return ChatCommand::Empty;
    }

    match line {
        "exit" | "quit" | "/exit" | "/quit" => return ChatCommand::Exit,
        "/help" => return ChatCommand::Help,
        "/peers" => return ChatCommand::Peers,
        _ => {}
    }

    if let Some(rest) = line.strip_prefix("/dm ") {
        return match split_message(rest) {
            Some((target, text)) => ChatCommand::Direct { target, text },
            None => ChatCommand::Invalid("Use format: /dm username:message".to_string()),
        };
    }

    if let Some(rest) = line.strip_prefix("/file ") {
        return match rest.trim().split_once(' ') {
            Some((target, path)) if !path.trim().is_empty() => ChatCommand::File {
                target: target.to_string(),
                path: PathBuf::from(path.trim()),
            },
            _ => ChatCommand::Invalid("Use format: /file username path".to_string()),
        };
    }

    if let Some(rest) = line.strip_prefix("/get ") {
        let target = rest.trim();
        return if target.is_empty() || target.contains(' ') {
            ChatCommand::Invalid("Use format: /get username".to_string())
        } else {
            ChatCommand::Get {
                target: target.to_string(),
            }
        };
    }

    if line.starts_with('/') {
        return ChatCommand::Invalid(format!("Unknown command {line:?}; try /help"));
    }

    match split_message(line) {
        Some((target, text)) => ChatCommand::Plain { target, text },
        None => ChatCommand::Invalid("Use format: username:message".to_string()),
    }
}

/// `<user>:<message>`; the message keeps any further colons
fn split_message(input: &str) -> Option<(String, String)> {
    let (target, text) = input.split_once(':')?;
    let target = target.trim();
    if target.is_empty() || target.contains(' ') {
        return None;
    }
    Some((target.to_string(), text.to_string()))
}

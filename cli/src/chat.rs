// Interactive chat client
//
// Connects to the broker, registers a username (prompting for another one
// when the directory refuses), then reads commands from stdin while printing
// session events as they arrive.

use crate::config::Config;
use crate::input::{parse_line, ChatCommand};
use anyhow::{Context, Result};
use async_trait::async_trait;
use colored::*;
use parley_core::{
    ClientSession, InboxMessage, RegisterFailure, RelayStatus, Resolution, ResolveMode,
    SessionError, SessionEvent, TcpLink, UsernameProvider,
};
use std::future::Future;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::watch;
use tracing::{debug, warn};

type StdinLines = Lines<BufReader<Stdin>>;

/// Offers the `--username` value first, then asks on stdin
struct PromptProvider<'a> {
    preset: Option<String>,
    lines: &'a mut StdinLines,
}

#[async_trait]
impl<'a> UsernameProvider for PromptProvider<'a> {
    async fn next_candidate(&mut self, last: Option<&RegisterFailure>) -> Option<String> {
        if let Some(failure) = last {
            println!("{} {}", "✗".red(), failure);
        }
        if let Some(name) = self.preset.take() {
            return Some(name);
        }

        loop {
            print!("Username: ");
            flush_stdout();
            match self.lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => return Some(line.trim().to_string()),
                Ok(None) => return None,
                Err(e) => {
                    warn!("Failed to read username: {}", e);
                    return None;
                }
            }
        }
    }
}

pub async fn run(config: &Config, username: Option<String>) -> Result<()> {
    let client_id = format!("parley-{}", uuid::Uuid::new_v4().simple());
    let (link, inbound) = TcpLink::connect(&config.broker_addr, &client_id)
        .await
        .with_context(|| format!("Failed to connect to broker at {}", config.broker_addr))?;
    println!("{} Connected to {}", "✓".green(), config.broker_addr);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut provider = PromptProvider {
        preset: username,
        lines: &mut lines,
    };

    let established = ClientSession::establish(
        Arc::new(link),
        inbound,
        &mut provider,
        config.session_config(),
    )
    .await;
    let (session, mut events) = match established {
        Ok(established) => established,
        Err(SessionError::Aborted) => {
            println!("No username registered; bye.");
            return Ok(());
        }
        Err(e) => return Err(anyhow::Error::new(e).context("Registration failed")),
    };

    println!(
        "{} Registered as {}",
        "✓".green(),
        session.username().as_str().bright_cyan()
    );
    print_help();
    prompt();

    let mut interrupt = crate::shutdown_signal();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SessionEvent::TransportLost) | None => {
                    println!("\n{} Lost connection to the broker", "✗".red());
                    break;
                }
                Some(event) => {
                    if print_event(&event) {
                        prompt();
                    }
                }
            },
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let command = parse_line(&line);
                    if command == ChatCommand::Exit {
                        break;
                    }
                    match until_interrupted(execute(&session, command), &mut interrupt).await {
                        Some(Ok(())) => {}
                        Some(Err(e)) => {
                            println!("{} {}", "✗".red(), e);
                            if matches!(e, SessionError::TransportDisconnect(_)) {
                                break;
                            }
                        }
                        None => {
                            println!();
                            break;
                        }
                    }
                    prompt();
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    break;
                }
            },
            _ = interrupted(&mut interrupt) => {
                println!();
                break;
            }
        }
    }

    println!("Shutting down...");
    if let Err(e) = session.shutdown().await {
        debug!("Shutdown finished with error: {}", e);
    }
    Ok(())
}

/// Resolves once the interrupt flag is set. A dropped sender never counts.
async fn interrupted(interrupt: &mut watch::Receiver<bool>) {
    if interrupt.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Run `fut` unless an interrupt arrives first, in which case `None`
async fn until_interrupted<F: Future>(
    fut: F,
    interrupt: &mut watch::Receiver<bool>,
) -> Option<F::Output> {
    tokio::select! {
        output = fut => Some(output),
        _ = interrupted(interrupt) => None,
    }
}

async fn execute(session: &ClientSession, command: ChatCommand) -> Result<(), SessionError> {
    match command {
        ChatCommand::Direct { target, text } => {
            // Re-resolve every time so a departed peer is noticed
            session.resolve_address(&target, ResolveMode::Broadcast).await?;
            session.send_direct(&target, &text).await?;
            println!("{} Sent to {}", "✓".green(), target.bright_cyan());
        }
        ChatCommand::File { target, path } => match session.send_file(&target, &path).await {
            Ok(bytes) => println!(
                "{} Sent {} ({} bytes) to {}",
                "✓".green(),
                path.display(),
                bytes,
                target.bright_cyan()
            ),
            Err(SessionError::PeerUnreachable(peer)) => println!(
                "{} {} is not currently connected (try /get {} first)",
                "✗".red(),
                peer,
                peer
            ),
            Err(e) => return Err(e),
        },
        ChatCommand::Get { target } => {
            let address = session.resolve_address(&target, ResolveMode::Targeted).await?;
            println!("  {} is at {}", target.bright_cyan(), address);
        }
        ChatCommand::Plain { target, text } => session.send_plain(&target, &text).await?,
        ChatCommand::Peers => {
            let peers = session.known_peers();
            if peers.is_empty() {
                println!("{}", "No known peers yet.".dimmed());
            } else {
                for (name, entry) in peers {
                    println!(
                        "  {} {} {}",
                        "•".bright_green(),
                        name.bright_cyan(),
                        entry.inbox_address.dimmed()
                    );
                }
            }
        }
        ChatCommand::Help => print_help(),
        ChatCommand::Invalid(hint) => println!("{}", hint.yellow()),
        ChatCommand::Exit | ChatCommand::Empty => {}
    }
    Ok(())
}

/// Print one session event. Returns whether anything was printed.
fn print_event(event: &SessionEvent) -> bool {
    match event {
        SessionEvent::Message(message) => {
            let line = match message {
                InboxMessage::ViaServer { sender, text } => {
                    format!("{} {} {}", "[via server]".dimmed(), sender.bright_cyan(), text)
                }
                InboxMessage::Direct { sender, text } => {
                    format!("{}: {}", sender.bright_cyan(), text)
                }
                InboxMessage::Plain(text) => text.clone(),
            };
            println!("\n{} {}", "←".bright_blue(), line);
        }
        SessionEvent::RelayStatus(RelayStatus::Delivered { target }) => {
            println!("\n{} Delivered to {} via the server", "✓".green(), target.bright_cyan());
        }
        SessionEvent::RelayStatus(RelayStatus::NotFound { target }) => {
            println!("\n{} {} is not connected", "✗".red(), target.bright_cyan());
        }
        SessionEvent::AddressResolved {
            name,
            resolution: Resolution::NotFound,
            ..
        } => {
            println!("\n{} {} is not connected", "✗".red(), name.bright_cyan());
        }
        SessionEvent::AddressResolved { .. } => return false,
        SessionEvent::FileReceived {
            sender,
            filename,
            saved_to,
            bytes,
        } => {
            println!(
                "\n{} {} sent {} ({} bytes), saved to {}",
                "✓".green(),
                sender.bright_cyan(),
                filename,
                bytes,
                saved_to.display()
            );
        }
        SessionEvent::FileFailed { sender, reason } => {
            let from = sender.as_deref().unwrap_or("unknown sender");
            println!("\n{} File from {} dropped: {}", "✗".red(), from, reason);
        }
        SessionEvent::TransportLost => return false,
    }
    true
}

fn print_help() {
    println!();
    println!("{}", "Commands:".bold());
    println!("  {}   relay through the directory", "<user>:<message>".bright_green());
    println!("  {} resolve, then send directly", "/dm <user>:<message>".bright_green());
    println!("  {}   send a file to a resolved peer", "/file <user> <path>".bright_green());
    println!("  {}            look up a user's inbox", "/get <user>".bright_green());
    println!("  {}                 list resolved peers", "/peers".bright_green());
    println!("  {}                   leave", "exit".bright_green());
    println!();
}

fn prompt() {
    print!("> ");
    flush_stdout();
}

fn flush_stdout() {
    let _ = std::io::stdout().flush();
}

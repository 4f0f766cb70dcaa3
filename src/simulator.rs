use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};

use dadbot_backend::store::MessageDirection;

use crate::api::{ApiClient, FrontendEvent, SimulatorHistory};

const HELP: &str = "Commands: /history, /test <message>, /journal delete <id>, /help, /quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    TestChat(String),
    History,
    DeleteJournal(String),
    Help,
    Quit,
    Empty,
    Unknown(String),
}

pub fn parse_command(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Command::Send(line.to_string());
    };

    let parts = rest.split_whitespace().collect::<Vec<_>>();
    match parts.as_slice() {
        ["quit" | "exit"] => Command::Quit,
        ["help"] => Command::Help,
        ["history"] => Command::History,
        ["journal", "delete", id] => Command::DeleteJournal(id.to_string()),
        ["test", _, ..] => {
            let message = rest.strip_prefix("test").unwrap_or_default().trim();
            Command::TestChat(message.to_string())
        }
        _ => Command::Unknown(line.to_string()),
    }
}

pub fn format_history(history: &SimulatorHistory) -> String {
    let mut out = String::new();
    if history.messages.is_empty() {
        out.push_str("(no messages yet)\n");
    }
    for message in &history.messages {
        let speaker = match message.direction {
            MessageDirection::Incoming => "You",
            MessageDirection::Outgoing => "Dad",
        };
        let marker = if message.journaled { " *" } else { "" };
        out.push_str(&format!(
            "[{}] {}: {}{}\n",
            message.created_at.format("%Y-%m-%d %H:%M"),
            speaker,
            message.content,
            marker
        ));
    }

    if !history.journal_entries.is_empty() {
        out.push_str("\nJournal (newest first):\n");
        for entry in &history.journal_entries {
            out.push_str(&format!(
                "- {} [{}] {}\n",
                entry.id,
                entry.created_at.format("%Y-%m-%d %H:%M"),
                entry.content
            ));
        }
    }
    out
}

/// Only journal and error events are worth interrupting the prompt for; the
/// replies already come back from the request itself.
pub fn format_event(event: &FrontendEvent) -> Option<String> {
    match event {
        FrontendEvent::JournalWritten { id, content } => {
            Some(format!("(Dad wrote in his journal [{}]: {})", id, content))
        }
        FrontendEvent::Error(message) => Some(format!("(backend error: {})", message)),
        FrontendEvent::ReplyGenerated { .. } => None,
    }
}

/// Interactive loop: lines from stdin go to the backend as `origin`; journal
/// events stream in between prompts.
pub async fn run(client: ApiClient, origin: String) -> Result<()> {
    let (event_tx, event_rx) = flume::unbounded();
    let stream = tokio::spawn(client.clone().stream_events_forever(event_tx));

    println!("Texting Dad as '{}' via {}", origin, client.base_url());
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !handle_line(&client, &origin, &line).await {
                    break;
                }
            }
            Ok(event) = event_rx.recv_async() => {
                if let Some(text) = format_event(&event) {
                    println!("{}", text);
                }
            }
        }
    }

    stream.abort();
    Ok(())
}

/// Returns false when the session should end.
async fn handle_line(client: &ApiClient, origin: &str, line: &str) -> bool {
    match parse_command(line) {
        Command::Empty => {}
        Command::Quit => return false,
        Command::Help => println!("{}", HELP),
        Command::Unknown(raw) => println!("Unknown command '{}'. {}", raw, HELP),
        Command::Send(message) => match client.send_message(origin, &message).await {
            Ok(reply) => println!("Dad: {}", reply.response),
            Err(error) => println!("(send failed: {:#})", error),
        },
        Command::TestChat(message) => match client.test_chat(origin, &message).await {
            Ok(reply) => println!("Dad (not saved): {}", reply),
            Err(error) => println!("(test-chat failed: {:#})", error),
        },
        Command::History => match client.history(origin).await {
            Ok(history) => print!("{}", format_history(&history)),
            Err(error) => println!("(history failed: {:#})", error),
        },
        Command::DeleteJournal(id) => match client.delete_journal_entry(&id).await {
            Ok(()) => println!("Deleted journal entry {}", id),
            Err(error) => println!("(delete failed: {:#})", error),
        },
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use dadbot_backend::store::{JournalEntry, Message};

    #[test]
    fn plain_lines_are_messages() {
        assert_eq!(
            parse_command("  I got the job!  "),
            Command::Send("I got the job!".to_string())
        );
        assert_eq!(parse_command("   "), Command::Empty);
    }

    #[test]
    fn slash_commands_parse() {
        assert_eq!(parse_command("/quit"), Command::Quit);
        assert_eq!(parse_command("/history"), Command::History);
        assert_eq!(
            parse_command("/journal delete abc-123"),
            Command::DeleteJournal("abc-123".to_string())
        );
        assert_eq!(
            parse_command("/test how are you"),
            Command::TestChat("how are you".to_string())
        );
    }

    #[test]
    fn malformed_commands_are_unknown() {
        assert!(matches!(parse_command("/journal delete"), Command::Unknown(_)));
        assert!(matches!(
            parse_command("/journal delete a b"),
            Command::Unknown(_)
        ));
        assert!(matches!(parse_command("/test"), Command::Unknown(_)));
        assert!(matches!(parse_command("/dance"), Command::Unknown(_)));
    }

    #[test]
    fn history_lists_speakers_and_journal() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap();
        let message = |content: &str, direction, journaled| Message {
            id: content.to_string(),
            conversation_id: "c1".to_string(),
            content: content.to_string(),
            direction,
            created_at: at,
            journaled,
        };
        let history = SimulatorHistory {
            messages: vec![
                message("hi dad", MessageDirection::Incoming, true),
                message("hey kiddo", MessageDirection::Outgoing, false),
            ],
            journal_entries: vec![JournalEntry {
                id: "j1".to_string(),
                conversation_id: "c1".to_string(),
                content: "He reached out today.".to_string(),
                created_at: at,
            }],
        };

        let rendered = format_history(&history);
        assert!(rendered.contains("[2026-03-01 12:30] You: hi dad *\n"));
        assert!(rendered.contains("[2026-03-01 12:30] Dad: hey kiddo\n"));
        assert!(rendered.contains("- j1 [2026-03-01 12:30] He reached out today."));
    }

    #[test]
    fn only_journal_and_error_events_are_printed() {
        assert!(format_event(&FrontendEvent::ReplyGenerated {
            conversation_id: "c".to_string(),
            origin_id: "o".to_string(),
            content: "x".to_string(),
        })
        .is_none());
        assert_eq!(
            format_event(&FrontendEvent::Error("boom".to_string())).as_deref(),
            Some("(backend error: boom)")
        );
    }
}

// Line-oriented terminal front end

use crate::client::ChatSession;
use crate::commands;
use crate::models::{Conversation, Role, ASSISTANT_STUB};
use crate::reconciler::{EntryState, ViewEntry};
use anyhow::Result;
use std::io::Write;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::{self, error::TryRecvError};
use uuid::Uuid;

const TICK: Duration = Duration::from_millis(100);

const HELP: &str = "\
Commands:
  /new [title]       start a conversation
  /list              list conversations
  /switch <n|id>     open a conversation from /list
  /rename <title>    rename the open conversation
  /delete            delete the open conversation
  /history           print the open conversation
  /stop              stop the reply being written
  /quit              exit
Anything else is sent as a message.";

/// The reply currently echoed to the terminal as it grows.
struct Follow {
    message_id: Uuid,
    printed: String,
}

enum Flow {
    Continue,
    Quit,
}

pub struct Cli {
    session: ChatSession,
    listing: Vec<Conversation>,
    follow: Option<Follow>,
}

impl Cli {
    pub fn new(session: ChatSession) -> Self {
        Self {
            session,
            listing: Vec::new(),
            follow: None,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let (tx, mut input) = mpsc::channel::<String>(16);
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });

        println!("streamchat. Type /help for commands.");
        prompt();
        loop {
            let line = if self.follow.is_some() {
                if let Err(e) = self.session.wait_for_update(TICK).await {
                    log::warn!("Failed to apply update: {}", e);
                }
                self.print_progress();
                match input.try_recv() {
                    Ok(line) => line,
                    Err(TryRecvError::Empty) => continue,
                    Err(TryRecvError::Disconnected) => break,
                }
            } else {
                match input.recv().await {
                    Some(line) => line,
                    None => break,
                }
            };

            match self.handle_line(line.trim()).await {
                Ok(Flow::Quit) => break,
                Ok(Flow::Continue) => {}
                Err(e) => eprintln!("error: {:#}", e),
            }
            if self.follow.is_none() {
                prompt();
            }
        }
        self.session.close();
        Ok(())
    }

    async fn handle_line(&mut self, line: &str) -> Result<Flow> {
        if line.is_empty() {
            return Ok(Flow::Continue);
        }
        let Some(command) = line.strip_prefix('/') else {
            self.send(line).await?;
            return Ok(Flow::Continue);
        };
        let (name, arg) = match command.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (command, ""),
        };

        match name {
            "quit" | "exit" => return Ok(Flow::Quit),
            "help" => println!("{}", HELP),
            "new" => {
                let title = (!arg.is_empty()).then_some(arg);
                let owner = self.session.owner().to_string();
                let conversation =
                    commands::create_conversation(self.session_state(), &owner, title).await?;
                self.session.switch_conversation(conversation.id).await?;
                println!("Opened \"{}\"", conversation.title);
            }
            "list" => self.list().await?,
            "switch" => {
                let id = self.resolve_conversation(arg)?;
                self.follow = None;
                self.session.switch_conversation(id).await?;
                self.print_history();
            }
            "rename" => {
                let id = self.require_open()?;
                let owner = self.session.owner().to_string();
                commands::rename_conversation(self.session_state(), &owner, &id.to_string(), arg)
                    .await?;
                println!("Renamed.");
            }
            "delete" => {
                let id = self.require_open()?;
                self.follow = None;
                self.session.close();
                let owner = self.session.owner().to_string();
                commands::delete_conversation(self.session_state(), &owner, &id.to_string())
                    .await?;
                println!("Deleted.");
            }
            "history" => {
                self.require_open()?;
                self.session.refresh().await?;
                self.print_history();
            }
            "stop" => match self.session.streaming_message_id() {
                Some(id) => self.session.stop(id).await?,
                None => println!("Nothing is being written."),
            },
            other => println!("Unknown command /{}. Type /help.", other),
        }
        Ok(Flow::Continue)
    }

    async fn send(&mut self, content: &str) -> Result<()> {
        if self.session.active_conversation().is_none() {
            let owner = self.session.owner().to_string();
            let conversation =
                commands::create_conversation(self.session_state(), &owner, None).await?;
            self.session.switch_conversation(conversation.id).await?;
        }
        let handle = self.session.submit(content).await?;
        let message_id = handle.receipt.assistant_message.id;
        // The publisher outcome is observed through the view; the task only needs to run
        drop(handle.completion);
        print!("assistant> ");
        flush();
        self.follow = Some(Follow {
            message_id,
            printed: String::new(),
        });
        Ok(())
    }

    fn print_progress(&mut self) {
        let Some(follow) = self.follow.as_mut() else {
            return;
        };
        let Some(entry) = self
            .session
            .view()
            .iter()
            .find(|e| e.id.server_id() == Some(follow.message_id))
        else {
            return;
        };
        if entry.state == EntryState::Placeholder && !entry.is_complete {
            return;
        }

        let content = entry.content.as_str();
        match content.strip_prefix(follow.printed.as_str()) {
            Some(rest) => print!("{}", rest),
            None => print!("\n{}", content),
        }
        flush();
        follow.printed = content.to_string();

        if entry.is_complete {
            println!();
            self.follow = None;
            prompt();
        }
    }

    async fn list(&mut self) -> Result<()> {
        let owner = self.session.owner().to_string();
        self.listing = commands::list_conversations(self.session_state(), &owner).await?;
        if self.listing.is_empty() {
            println!("No conversations yet. Type a message or /new.");
        }
        let active = self.session.active_conversation();
        for (i, conversation) in self.listing.iter().enumerate() {
            let marker = if Some(conversation.id) == active { '*' } else { ' ' };
            println!(
                "{}{:>3}. {}  ({})",
                marker,
                i + 1,
                conversation.title,
                conversation.updated_at.format("%Y-%m-%d %H:%M")
            );
        }
        Ok(())
    }

    fn resolve_conversation(&self, arg: &str) -> Result<Uuid> {
        if let Ok(n) = arg.parse::<usize>() {
            return self
                .listing
                .get(n.wrapping_sub(1))
                .map(|c| c.id)
                .ok_or_else(|| anyhow::anyhow!("No conversation #{} in the last /list", n));
        }
        Uuid::parse_str(arg).map_err(|_| anyhow::anyhow!("Expected a /list number or an id"))
    }

    fn require_open(&self) -> Result<Uuid> {
        self.session
            .active_conversation()
            .ok_or_else(|| anyhow::anyhow!("No conversation is open"))
    }

    fn print_history(&self) {
        for entry in self.session.view() {
            println!("{}", render(entry));
        }
    }

    fn session_state(&self) -> &crate::state::AppState {
        self.session.state()
    }
}

fn render(entry: &ViewEntry) -> String {
    let who = match entry.role {
        Role::User => "you",
        Role::Assistant => "assistant",
    };
    let body = if entry.state == EntryState::Placeholder {
        ASSISTANT_STUB
    } else {
        entry.content.as_str()
    };
    let marker = match entry.state {
        EntryState::PendingLocal => " (sending)",
        EntryState::Streaming => " (writing)",
        _ => "",
    };
    format!("{}{}> {}", who, marker, body)
}

fn prompt() {
    print!("> ");
    flush();
}

fn flush() {
    if let Err(e) = std::io::stdout().flush() {
        log::debug!("stdout flush failed: {}", e);
    }
}

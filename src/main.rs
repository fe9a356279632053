use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{info, warn, Level};

use pagewise::config::history_path;
use pagewise::query::{QueryCompletion, QueryId, SelectedPage};
use pagewise::{
    AgentClient, ConversationHistory, Disconnected, LogObserver, Observers, Orchestrator,
    OrchestratorConfig, QueryObserver,
};

const USAGE: &str = "usage:
  pagewise ask [--conversation ID] [--page PAGE_ID] <question>...
  pagewise history [CONVERSATION_ID]";

enum Finished {
    Completed(QueryCompletion),
    Failed(QueryId, String),
}

/// Forwards terminal query events to the command loop.
struct ChannelObserver {
    tx: mpsc::UnboundedSender<Finished>,
}

impl QueryObserver for ChannelObserver {
    fn query_completed(&self, completion: &QueryCompletion) {
        let _ = self.tx.send(Finished::Completed(completion.clone()));
    }

    fn query_failed(&self, query_id: &QueryId, message: &str) {
        let _ = self
            .tx
            .send(Finished::Failed(query_id.clone(), message.to_string()));
    }
}

#[derive(Debug, Default, PartialEq)]
struct AskArgs {
    conversation_id: Option<String>,
    page_id: Option<String>,
    questions: Vec<String>,
}

fn parse_ask(args: &[String]) -> Result<AskArgs> {
    let mut parsed = AskArgs::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--conversation" => {
                parsed.conversation_id =
                    Some(iter.next().context("--conversation needs a value")?.clone());
            }
            "--page" => {
                parsed.page_id = Some(iter.next().context("--page needs a value")?.clone());
            }
            _ => parsed.questions.push(arg.clone()),
        }
    }
    if parsed.questions.is_empty() {
        anyhow::bail!("no question given\n{}", USAGE);
    }
    Ok(parsed)
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();
    let level = dotenv::var("LOG_LEVEL")
        .ok()
        .and_then(|l| l.parse::<Level>().ok())
        .unwrap_or(Level::DEBUG);
    tracing_subscriber::fmt().with_max_level(level).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.split_first() {
        Some((cmd, rest)) if cmd == "ask" => ask(rest).await,
        Some((cmd, rest)) if cmd == "history" => history(rest).await,
        _ => {
            eprintln!("{}", USAGE);
            Ok(())
        }
    }
}

async fn ask(args: &[String]) -> Result<()> {
    let args = parse_ask(args)?;

    let config = OrchestratorConfig::from_env()?;
    let client = AgentClient::from_env()?;
    info!(endpoint = %client.config().endpoint(), "Agent client initialized");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let observer = Observers::new()
        .with(Arc::new(LogObserver))
        .with(Arc::new(ChannelObserver { tx }));
    let orchestrator = Orchestrator::new(config, Arc::new(client), Arc::new(observer))?;

    let mut pending = 0usize;
    for question in &args.questions {
        match orchestrator.submit(
            question.clone(),
            args.conversation_id.clone(),
            args.page_id.clone(),
        ) {
            Some(_) => pending += 1,
            None => warn!(question, "Too many queries in flight, question skipped"),
        }
    }

    let path = history_path();
    let mut history = ConversationHistory::load(&path).await?;
    let mut recorded = false;

    while pending > 0 {
        let Some(finished) = rx.recv().await else {
            break;
        };
        pending -= 1;
        match finished {
            Finished::Completed(completion) => {
                print_answer(
                    &completion.question,
                    completion.title.as_deref(),
                    &completion.answer,
                    &completion.pages,
                );
                recorded |= history.record(&completion);
            }
            Finished::Failed(id, message) => {
                let question = orchestrator
                    .query(&id)
                    .map(|q| q.question)
                    .unwrap_or_default();
                eprintln!("\n✗ {}\n  {}", question, message);
            }
        }
    }

    if recorded {
        history.save(&path).await?;
        info!(path = %path.display(), "Conversation history saved");
    }
    Ok(())
}

async fn history(args: &[String]) -> Result<()> {
    let path = history_path();
    let history = ConversationHistory::load(&path).await?;

    let Some(conversation_id) = args.first() else {
        for id in history.conversation_ids() {
            println!("{}  ({} turns)", id, history.turns(id).len());
        }
        return Ok(());
    };

    let turns = history.turns(conversation_id);
    if turns.is_empty() {
        println!("No turns recorded for {}", conversation_id);
        return Ok(());
    }

    let orchestrator = Orchestrator::new(
        OrchestratorConfig::default(),
        Arc::new(Disconnected),
        Arc::new(LogObserver),
    )?;
    for turn in turns {
        orchestrator.restore_turn(conversation_id, turn);
        if let Some(query) = orchestrator.active_query() {
            print_answer(
                &query.question,
                query.display_title.as_deref(),
                &query.answer,
                &query.pages,
            );
        }
    }
    Ok(())
}

fn print_answer(question: &str, title: Option<&str>, answer: &str, pages: &[SelectedPage]) {
    println!("\n## {}", title.unwrap_or(question));
    if title.is_some() {
        println!("> {}", question);
    }
    println!("\n{}", answer.trim());
    if pages.is_empty() {
        return;
    }
    println!("\nPages:");
    for page in pages {
        println!("  - {} ({})", page.page_name, page.file_path);
        for pointer in &page.pointers {
            println!(
                "      * {} @ ({:.2}, {:.2}, {:.2}, {:.2})",
                pointer.label, pointer.bbox.x, pointer.bbox.y, pointer.bbox.width, pointer.bbox.height
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_ask_flags_and_questions() {
        let parsed = parse_ask(&args(&[
            "--conversation",
            "c1",
            "Where are the stairs?",
            "--page",
            "p4",
            "What is the slab depth?",
        ]))
        .unwrap();
        assert_eq!(parsed.conversation_id.as_deref(), Some("c1"));
        assert_eq!(parsed.page_id.as_deref(), Some("p4"));
        assert_eq!(
            parsed.questions,
            vec!["Where are the stairs?", "What is the slab depth?"]
        );
    }

    #[test]
    fn test_parse_ask_requires_question() {
        assert!(parse_ask(&args(&["--conversation", "c1"])).is_err());
        assert!(parse_ask(&args(&["--page"])).is_err());
    }
}

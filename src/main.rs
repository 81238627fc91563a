// Console front end for the ticket memory.
//
// **Architecture Overview:**
// - `core/` = Business logic (storage-agnostic)
// - `infra/` = Implementations of core traits (SQLite, JSON files)
//
// This file's job is to:
// 1. Load configuration
// 2. Open the stores once and inject them into the services
// 3. Read commands from stdin until EOF or `!quit`
// 4. Close the database on the way out
//
// A real deployment swaps the console loop for a chat-platform adapter that
// calls the same services.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};

use ticket_memory::core::memory::{
    AnswerGenerator, ConversationService, GenerationContext, KnowledgeService, MemoryConfig,
    QueryResolver, ReplySource, TrainingService,
};
use ticket_memory::infra::memory::{JsonCollectionStore, SqliteMemoryStore};

const CONSOLE_TICKET: &str = "console";
const CONSOLE_USER: &str = "console-user";
const BOT_ID: &str = "ticket-memory";

/// The console has no language model behind it, so anything without a
/// trained answer goes unanswered.
struct NoGenerator;

#[async_trait]
impl AnswerGenerator for NoGenerator {
    async fn generate(&self, prompt: &str, context: &GenerationContext) -> Option<String> {
        tracing::debug!(
            similar = context.similar.len(),
            prompt_chars = prompt.chars().count(),
            "No generator configured"
        );
        None
    }
}

#[derive(Debug, PartialEq)]
enum Command<'a> {
    Train {
        question: &'a str,
        answer: &'a str,
        category: &'a str,
    },
    Close,
    Stats,
    KbCreate {
        name: &'a str,
        description: &'a str,
    },
    KbAdd {
        name: &'a str,
        question: &'a str,
        answer: &'a str,
        category: &'a str,
    },
    KbSearch {
        name: &'a str,
        query: &'a str,
    },
    KbList,
    KbExport {
        name: &'a str,
        path: &'a str,
    },
    KbImport {
        name: &'a str,
        path: &'a str,
    },
    Help,
    Quit,
    Ask(&'a str),
}

const HELP: &str = "\
Commands:
  !train <question> | <answer> [| <category>]
  !close                          close the console ticket
  !stats
  !kb create <name> [description]
  !kb add <name> | <question> | <answer> [| <category>]
  !kb search <name> <query>
  !kb list
  !kb export <name> <path>
  !kb import <name> <path>
  !quit
Anything else is treated as a question.";

fn split_pipes(rest: &str) -> Vec<&str> {
    rest.split('|').map(str::trim).collect()
}

fn split_word(rest: &str) -> (&str, &str) {
    match rest.trim().split_once(char::is_whitespace) {
        Some((word, tail)) => (word, tail.trim()),
        None => (rest.trim(), ""),
    }
}

/// `None` for a malformed command.
fn parse_command(line: &str) -> Option<Command<'_>> {
    let line = line.trim();
    if !line.starts_with('!') {
        return Some(Command::Ask(line));
    }

    let (command, rest) = split_word(&line[1..]);
    match command {
        "train" => match split_pipes(rest).as_slice() {
            &[question, answer] => Some(Command::Train {
                question,
                answer,
                category: "",
            }),
            &[question, answer, category] => Some(Command::Train {
                question,
                answer,
                category,
            }),
            _ => None,
        },
        "close" => Some(Command::Close),
        "stats" => Some(Command::Stats),
        "help" => Some(Command::Help),
        "quit" | "exit" => Some(Command::Quit),
        "kb" => {
            let (sub, rest) = split_word(rest);
            match sub {
                "create" if !rest.is_empty() => {
                    let (name, description) = split_word(rest);
                    Some(Command::KbCreate { name, description })
                }
                "add" => match split_pipes(rest).as_slice() {
                    &[name, question, answer] => Some(Command::KbAdd {
                        name,
                        question,
                        answer,
                        category: "",
                    }),
                    &[name, question, answer, category] => Some(Command::KbAdd {
                        name,
                        question,
                        answer,
                        category,
                    }),
                    _ => None,
                },
                "search" => {
                    let (name, query) = split_word(rest);
                    (!name.is_empty() && !query.is_empty())
                        .then_some(Command::KbSearch { name, query })
                }
                "list" => Some(Command::KbList),
                "export" | "import" => {
                    let (name, path) = split_word(rest);
                    if name.is_empty() || path.is_empty() {
                        None
                    } else if sub == "export" {
                        Some(Command::KbExport { name, path })
                    } else {
                        Some(Command::KbImport { name, path })
                    }
                }
                _ => None,
            }
        }
        _ => None,
    }
}

#[tokio::main]
async fn main() {
    // Load environment variables from .env file (if it exists)
    dotenv::dotenv().ok();

    // Initialize logging so we can see what's happening
    tracing_subscriber::fmt::init();

    let config = MemoryConfig::from_env();
    config.validate().expect("Invalid memory configuration");

    // ========================================================================
    // DEPENDENCY INJECTION
    // ========================================================================
    // Open every store once and hand it to the services that need it.
    // This is the "composition root" where we wire everything together.

    let store = SqliteMemoryStore::open(&config.database_path)
        .await
        .expect("Failed to open training database");
    let collection_store = JsonCollectionStore::new(&config.knowledge_dir)
        .await
        .expect("Failed to initialize knowledge directory");

    let training = Arc::new(
        TrainingService::new(store.clone()).with_max_entries(config.max_training_entries),
    );
    let conversations = Arc::new(ConversationService::new(store.clone()));
    let knowledge = KnowledgeService::new(collection_store, Arc::clone(&training));
    let resolver = QueryResolver::new(Arc::clone(&training), Arc::clone(&conversations), &config);

    conversations
        .create(CONSOLE_TICKET, CONSOLE_USER, "general")
        .await;

    tracing::info!("Ticket memory ready. Type !help for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::error!("Failed to read stdin: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let Some(command) = parse_command(&line) else {
            println!("Unrecognised command. Type !help for usage.");
            continue;
        };

        match command {
            Command::Train {
                question,
                answer,
                category,
            } => {
                if training.train(question, answer, category).await {
                    println!("Trained.");
                } else {
                    println!("Not stored (empty text, store full or storage error).");
                }
            }
            Command::Close => {
                if conversations.close(CONSOLE_TICKET).await {
                    println!("Ticket closed.");
                }
            }
            Command::Stats => {
                let stats = resolver.stats().await;
                println!(
                    "Training entries: {}\nMessages: {}\nOpen tickets: {}\nTotal usage: {}",
                    stats.total_training_entries,
                    stats.total_conversations,
                    stats.open_tickets,
                    stats.total_usage
                );
            }
            Command::KbCreate { name, description } => {
                if knowledge.create(name, description).await {
                    println!("Created knowledge base {name}.");
                } else {
                    println!("Could not create {name}.");
                }
            }
            Command::KbAdd {
                name,
                question,
                answer,
                category,
            } => {
                if knowledge
                    .add_entry(name, question, answer, category, Vec::new())
                    .await
                {
                    println!("Added to {name}.");
                } else {
                    println!("Not added (missing collection or duplicate question).");
                }
            }
            Command::KbSearch { name, query } => {
                let results = knowledge.search(name, query, 5).await;
                if results.is_empty() {
                    println!("No matches.");
                }
                for found in results {
                    println!(
                        "[{:.2}] {} -> {}",
                        found.score, found.entry.question, found.entry.answer
                    );
                }
            }
            Command::KbList => {
                for name in knowledge.list().await {
                    match knowledge.stats(&name).await {
                        Some(stats) => println!("{name} ({} entries)", stats.total_entries),
                        None => println!("{name}"),
                    }
                }
            }
            Command::KbExport { name, path } => match knowledge.export_to_file(name, path).await {
                Some(path) => println!("Exported to {}", path.display()),
                None => println!("Export failed."),
            },
            Command::KbImport { name, path } => {
                if knowledge.import_from_file(name, path).await {
                    println!("Imported {name}.");
                } else {
                    println!("Import failed.");
                }
            }
            Command::Help => println!("{HELP}"),
            Command::Quit => break,
            Command::Ask(query) => {
                match resolver
                    .respond(CONSOLE_TICKET, CONSOLE_USER, query, BOT_ID, &NoGenerator)
                    .await
                {
                    Some(reply) => {
                        if let ReplySource::Trained { score, .. } = reply.source {
                            tracing::debug!(score, "Answered from training data");
                        }
                        println!("{}", reply.text);
                    }
                    None => println!("I don't know that one yet. Teach me with !train."),
                }
            }
        }
    }

    store.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_a_question() {
        assert_eq!(
            parse_command("  where is my order? "),
            Some(Command::Ask("where is my order?"))
        );
    }

    #[test]
    fn parses_train_with_optional_category() {
        assert_eq!(
            parse_command("!train Hours? | 9-5"),
            Some(Command::Train {
                question: "Hours?",
                answer: "9-5",
                category: ""
            })
        );
        assert_eq!(
            parse_command("!train Hours? | 9-5 | info"),
            Some(Command::Train {
                question: "Hours?",
                answer: "9-5",
                category: "info"
            })
        );
        assert_eq!(parse_command("!train just a question"), None);
    }

    #[test]
    fn parses_kb_commands() {
        assert_eq!(
            parse_command("!kb create faq Shop questions"),
            Some(Command::KbCreate {
                name: "faq",
                description: "Shop questions"
            })
        );
        assert_eq!(
            parse_command("!kb add faq | Hours? | 9-5"),
            Some(Command::KbAdd {
                name: "faq",
                question: "Hours?",
                answer: "9-5",
                category: ""
            })
        );
        assert_eq!(
            parse_command("!kb search faq opening hours"),
            Some(Command::KbSearch {
                name: "faq",
                query: "opening hours"
            })
        );
        assert_eq!(
            parse_command("!kb export faq out/faq.json"),
            Some(Command::KbExport {
                name: "faq",
                path: "out/faq.json"
            })
        );
        assert_eq!(parse_command("!kb create"), None);
        assert_eq!(parse_command("!kb search faq"), None);
        assert_eq!(parse_command("!kb nonsense"), None);
    }

    #[test]
    fn unknown_bang_command_is_rejected() {
        assert_eq!(parse_command("!dance"), None);
        assert_eq!(parse_command("!quit"), Some(Command::Quit));
    }
}

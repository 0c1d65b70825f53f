use std::env;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kbase_agent::memory::ConversationMemory;
use kbase_agent::{Agent, Config, ConversationOptions, DirectorySearchEngine};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

const READY_WAIT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config_path = env::args().nth(1).map(PathBuf::from);
    let config = Config::load_or_default(config_path.as_deref())?;

    let engine = DirectorySearchEngine::new(&config.knowledge_base.path)
        .with_extensions(config.knowledge_base.extensions.clone());
    let agent = Agent::from_config(&config, Arc::new(engine))?;

    eprintln!("knowledge base: {}", config.knowledge_base.path.display());
    if !agent.wait_until_ready(READY_WAIT).await {
        eprintln!("warning: no provider answered within {}s", READY_WAIT.as_secs());
    }
    eprintln!("provider: {}", agent.provider().name());
    eprintln!("session: {}", agent.session_id());
    eprintln!("commands: /new, /title, /stats, /sessions, exit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => continue,
            "exit" | "quit" => break,
            "/new" => {
                eprintln!("session: {}", agent.start_conversation());
                continue;
            }
            "/title" => {
                println!("{}", agent.generate_title().await);
                continue;
            }
            "/stats" => {
                println!("{}", serde_json::to_string_pretty(&agent.stats().await)?);
                continue;
            }
            "/sessions" => {
                match &config.memory.storage_dir {
                    Some(dir) => {
                        for session in ConversationMemory::list_sessions(dir)? {
                            println!(
                                "{}  {:>3} messages  {}",
                                session.session_id,
                                session.message_count,
                                truncate(&session.preview, 60)
                            );
                        }
                    }
                    None => eprintln!("memory.storage_dir is not configured"),
                }
                continue;
            }
            _ => {}
        }

        let options = ConversationOptions {
            max_tokens: config.agent.max_tokens,
            temperature: config.agent.temperature,
            context_limit: config.agent.context_limit,
            ..ConversationOptions::default()
        }
        .with_status(|status| eprintln!("  {status}"));

        let response = agent.send_message_with(line, options).await?;
        println!("\n{}\n", response.content.trim());
    }

    agent.shutdown();
    Ok(())
}

fn truncate(input: &str, max_chars: usize) -> String {
    let mut output = input.chars().take(max_chars).collect::<String>();
    if input.chars().count() > max_chars {
        output.push_str("...");
    }
    output
}

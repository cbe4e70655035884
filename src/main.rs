use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use palaver::chat::{Config, Node};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    info!("palaver — LAN chat");

    let node = Node::new(Config::default());
    let mut messages = node.subscribe();
    node.start();

    tokio::spawn(async move {
        while let Ok(msg) = messages.recv().await {
            println!("<{}> {}", msg.name, msg.text);
        }
    });

    // Lines from stdin become messages; `/name` changes the display name.
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if let Some(name) = line.strip_prefix("/name ") {
            if let Err(e) = node.set_name(name).await {
                eprintln!("! {e}");
            }
        } else if !line.trim().is_empty() {
            if let Err(e) = node.say(&line).await {
                eprintln!("! {e}");
            }
        }
    }

    Ok(())
}

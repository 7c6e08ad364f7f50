//! Streaming request against the paid Kimi endpoint.
//!
//! Run with: PRIVATE_KEY=0x... cargo run --example streaming

use std::env;
use std::io::Write;
use std::process;
use tracing_subscriber::EnvFilter;
use x402_llm::client::DEFAULT_BASE_URL;
use x402_llm::{Client, Credential, Message, Model};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let Ok(private_key) = env::var("PRIVATE_KEY") else {
        eprintln!("Error: PRIVATE_KEY environment variable not set");
        process::exit(1);
    };
    let client = match Credential::from_hex(&private_key).and_then(|credential| {
        Client::builder()
            .base_url(env::var("JATEVO_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()))
            .credential(credential)
            .build()
    }) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    };

    println!("Starting streaming response...\n");

    let stream = client
        .chat(
            Model::Kimi.path(),
            vec![Message::user(
                "Tell me a short story about a robot learning to code",
            )],
        )
        .temperature(0.8)
        .max_tokens(500)
        .stream()
        .await;

    let mut stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("Error: {e}");
            return Ok(());
        }
    };

    let mut stdout = std::io::stdout();
    while let Some(fragment) = stream.next().await {
        match fragment {
            Ok(text) => {
                print!("{text}");
                stdout.flush()?;
            }
            Err(e) => {
                eprintln!("\nStream error: {e}");
                return Ok(());
            }
        }
    }

    println!("\n\nStream complete!");
    if let Some(amount) = stream.amount_paid() {
        println!("Done! Cost: ${amount} USDC");
    }

    Ok(())
}

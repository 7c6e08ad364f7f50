//! Buffered request against the paid Qwen endpoint.
//!
//! Run with: PRIVATE_KEY=0x... cargo run --example basic

use std::env;
use std::process;
use tracing_subscriber::EnvFilter;
use x402_llm::client::DEFAULT_BASE_URL;
use x402_llm::{message_content, Client, Credential, Error, Message, Model};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let Ok(private_key) = env::var("PRIVATE_KEY") else {
        eprintln!("Error: PRIVATE_KEY environment variable not set");
        eprintln!("Set it with: export PRIVATE_KEY=\"0x...\"");
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

    println!("Calling Qwen model...\n");

    let result = client
        .chat(
            Model::Qwen.path(),
            vec![Message::user("Write a haiku about programming")],
        )
        .temperature(0.7)
        .max_tokens(100)
        .send()
        .await;

    match result {
        Ok(response) => {
            println!("Response:");
            println!("{}", message_content(&response.body).unwrap_or_default());
            match response.amount_paid {
                Some(amount) => println!("\nSuccess! Cost: ${amount} USDC"),
                None => println!("\nSuccess!"),
            }
        }
        Err(e) => {
            eprintln!("Error: {e}");
            if e.status() == Some(402) || matches!(e, Error::PaymentLimit { .. }) {
                eprintln!("\nTip: Check your USDC balance on Base network");
            }
        }
    }

    Ok(())
}

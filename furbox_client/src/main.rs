//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p furbox_client -- [--url ws://host:4000/socket/websocket]
//!       [--topic world:lobby] [--frame-hz 60] [--config client.json]
//!
//! The client joins the game channel, samples held keys every frame and
//! logs interpolated entity positions.
//!
//! Console commands:
//!   press <key>    - Hold a key (up/down/left/right, w/a/s/d, space)
//!   release <key>  - Release a key
//!   status         - Show client status
//!   leave | quit   - Leave the channel and exit

use std::env;
use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::Context;
use furbox_client::{
    input::{Key, KeyEvent},
    scene::LogScene,
    ClientInput, GameClient,
};
use furbox_shared::config::ClientConfig;
use tokio::sync::mpsc;
use tracing::info;

fn parse_args() -> anyhow::Result<ClientConfig> {
    let args: Vec<String> = env::args().collect();

    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => ClientConfig::load(&PathBuf::from(&args[i + 1]))?,
        _ => ClientConfig::default(),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--url" if i + 1 < args.len() => {
                cfg.socket_url = args[i + 1].clone();
                i += 2;
            }
            "--topic" if i + 1 < args.len() => {
                cfg.topic = args[i + 1].clone();
                i += 2;
            }
            "--frame-hz" if i + 1 < args.len() => {
                cfg.frame_hz = args[i + 1].parse().context("parse --frame-hz")?;
                i += 2;
            }
            _ => i += 1,
        }
    }

    cfg.validate()?;
    Ok(cfg)
}

/// Turns one console line into client inputs.
fn parse_line(line: &str) -> Result<Vec<ClientInput>, String> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let key = |name: Option<&&str>| -> Result<Key, String> {
        let name = name.ok_or_else(|| "Usage: press|release <key>".to_string())?;
        Key::from_name(name).ok_or_else(|| format!("Unknown key '{name}'"))
    };

    match tokens.first().copied() {
        None => Ok(Vec::new()),
        Some("press") => Ok(vec![ClientInput::Key(KeyEvent::Down(key(tokens.get(1))?))]),
        Some("release") => Ok(vec![ClientInput::Key(KeyEvent::Up(key(tokens.get(1))?))]),
        Some("status") => Ok(vec![ClientInput::Status]),
        Some("leave" | "quit" | "exit") => Ok(vec![ClientInput::Leave]),
        Some(other) => Err(format!("Unknown command '{other}'")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(url = %cfg.socket_url, topic = %cfg.topic, frame_hz = cfg.frame_hz, "Starting client");

    let client = GameClient::connect(&cfg).await.context("connect")?;
    let mut client = client.with_scene(Box::new(LogScene::new(cfg.frame_hz as u64)));

    // Set up console input channel.
    let (input_tx, input_rx) = mpsc::channel::<ClientInput>(32);
    client.attach_input(input_rx);

    // Spawn stdin reader thread.
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            match parse_line(line.trim()) {
                Ok(inputs) => {
                    for input in inputs {
                        if input_tx.blocking_send(input).is_err() {
                            return;
                        }
                    }
                }
                Err(msg) => println!("{msg}"),
            }
        }
    });

    println!("Joined. Type 'press up', 'release up', 'status', or 'quit'.");
    println!();

    client.run().await?;
    client.leave().await?;
    client.into_channel().shutdown().await?;

    println!("Disconnected.");
    Ok(())
}

//! Interactive line client: relays stdin to the server and prints whatever
//! the server sends back.
//!
//! Usage: `test_client [address]`, then type protocol lines such as
//! `session my-session` or `join-game {"pin":42,"name":"Ann"}`.

use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let server_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8080".to_string());

    let stream = TcpStream::connect(&server_addr).await?;
    println!("Connected to {} from {}", server_addr, stream.local_addr()?);

    let (reader, mut writer) = stream.into_split();
    let mut server_lines = BufReader::new(reader).lines();
    let mut input_lines = BufReader::new(tokio::io::stdin()).lines();
    let started = Instant::now();
    let mut last_sent: Option<Instant> = None;

    loop {
        tokio::select! {
            line = server_lines.next_line() => match line? {
                Some(line) => {
                    let since_send = last_sent
                        .map(|sent| sent.elapsed())
                        .unwrap_or(Duration::ZERO);
                    println!(
                        "[{:>7.3}s, +{}ms] < {}",
                        started.elapsed().as_secs_f32(),
                        since_send.as_millis(),
                        line
                    );
                }
                None => {
                    println!("Server closed the connection");
                    break;
                }
            },
            line = input_lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    writer.write_all(format!("{}\n", line.trim()).as_bytes()).await?;
                    last_sent = Some(Instant::now());
                }
                None => break,
            },
        }
    }

    Ok(())
}

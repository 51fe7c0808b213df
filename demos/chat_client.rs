//! Line-oriented client: sends stdin lines, prints whatever the server sends.
//!
//! ```text
//! cargo run --example chat_client -- demo alice
//! ```

use pipeplex::codec::TextCodec;
use pipeplex::Client;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> pipeplex::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let server = args.next().unwrap_or_else(|| "demo".to_string());
    let nick = args.next().unwrap_or_else(|| "anonymous".to_string());

    let client = Client::builder(server.clone(), TextCodec)
        .name(nick.clone())
        .on_message(|_, msg| {
            println!("< {}", msg);
            Ok(())
        })
        .on_disconnected(|_| {
            println!("* disconnected");
            Ok(())
        })
        .start();

    println!("* waiting for {}", server);
    if !client.wait_for_connection().await {
        return Ok(());
    }
    println!("* connected as {}", nick);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if !line.is_empty() => client.push_message(format!("{}: {}", nick, line)),
                Some(_) => {}
                None => break,
            },
            _ = client.wait_for_disconnection() => break,
        }
    }

    client.stop().await;
    Ok(())
}

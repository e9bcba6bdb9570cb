use anyhow::{bail, Result};
use futures::StreamExt;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::cli::url::process_telemetry_url;
use crate::cli::WatchArgs;
use crate::progress::ProgressEvent;

/// One-line rendering of a progress frame.
pub fn describe_event(event: &ProgressEvent) -> String {
    match event {
        ProgressEvent::Progress { progress, message } => format!("[{:5.1}%] {}", progress, message),
        ProgressEvent::Complete { data } => format!(
            "complete: {} ({} drivers, {} frames)",
            data.metadata.event_name,
            data.drivers.len(),
            data.frame_count()
        ),
        ProgressEvent::Error { message, .. } => format!("error: {}", message),
    }
}

pub async fn execute_watch(args: WatchArgs) -> Result<()> {
    let url = process_telemetry_url(&args.url, &args.session.params());

    eprintln!("Connecting to {}...", url);

    let (ws_stream, _) = connect_async(&url).await?;
    let (_, mut read) = ws_stream.split();

    eprintln!("Connected. Press Ctrl+C to stop.\n");

    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if args.raw {
                    println!("{}", text);
                    continue;
                }
                match serde_json::from_str::<ProgressEvent>(&text) {
                    Ok(ProgressEvent::Error { message, .. }) => bail!("Run failed: {}", message),
                    Ok(event) => println!("{}", describe_event(&event)),
                    Err(_) => println!("{}", text),
                }
            }
            Ok(Message::Close(_)) => {
                eprintln!("Connection closed by server");
                break;
            }
            Err(e) => {
                eprintln!("WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_progress() {
        let event = ProgressEvent::progress(42.5, "Processed VER (1/2)");
        assert_eq!(describe_event(&event), "[ 42.5%] Processed VER (1/2)");
        assert_eq!(
            describe_event(&ProgressEvent::error("upstream down")),
            "error: upstream down"
        );
    }
}

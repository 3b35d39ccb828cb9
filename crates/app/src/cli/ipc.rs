//! TCP gain-update listener
//!
//! Each newline-terminated message is a JSON array of band gains. The reply
//! is `OK\n` when the whole vector was applied and `ERROR\n` otherwise.

use minstrel_core::domain::dsp::GainControl;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

const REPLY_OK: &[u8] = b"OK\n";
const REPLY_ERROR: &[u8] = b"ERROR\n";

/// Bind the listener on `host:port`
pub async fn bind(host: &str, port: u16) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind((host, port)).await?;
    info!(addr = %listener.local_addr()?, "Gain-update listener ready");
    Ok(listener)
}

/// Accept connections until the task is dropped
pub async fn serve(listener: TcpListener, control: GainControl) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "Gain-update client connected");
                let control = control.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, control).await {
                        debug!(%peer, error = %e, "Gain-update client dropped");
                    }
                });
            }
            Err(e) => warn!(error = %e, "Failed to accept gain-update client"),
        }
    }
}

async fn handle_client(stream: TcpStream, control: GainControl) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = match control.apply_json(&line) {
            Ok(()) => REPLY_OK,
            Err(_) => REPLY_ERROR,
        };
        write_half.write_all(reply).await?;
        write_half.flush().await?;
    }
    Ok(())
}

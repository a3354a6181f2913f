//! TCP accept loop

use std::future::Future;

use tokio::net::TcpListener;
use tokio::task::JoinSet;

use crate::protocol::ProtocolEngine;

/// Accept connections until `shutdown` resolves, then wait for the
/// connections already in flight to finish.
pub async fn serve<F>(listener: TcpListener, engine: ProtocolEngine, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("No longer accepting connections");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        tracing::debug!(peer = %addr, "Accepted connection");
                        let engine = engine.clone();
                        connections.spawn(async move {
                            engine.handle_connection(stream, &addr.to_string()).await;
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to accept connection");
                    }
                }
            }
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Connection task panicked");
                }
            }
        }
    }

    let in_flight = connections.len();
    if in_flight > 0 {
        tracing::info!(connections = in_flight, "Waiting for open connections to finish");
    }
    while let Some(joined) = connections.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "Connection task panicked");
        }
    }

    Ok(())
}

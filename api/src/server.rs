use crate::app::App;
use crate::routes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Source of inbound connections.
pub trait Accept {
    fn next_conn(&mut self) -> impl Future<Output = io::Result<TcpStream>> + Send;
}

impl Accept for TcpListener {
    async fn next_conn(&mut self) -> io::Result<TcpStream> {
        let (stream, _) = self.accept().await?;
        Ok(stream)
    }
}

/// Serves HTTP/1 connections until `shutdown` resolves, then drains the
/// enqueues of already admitted payments. Accept errors (fd exhaustion,
/// aborted handshakes) are logged and retried after a short pause.
pub async fn serve<I, F>(mut incoming: I, app: Arc<App>, shutdown: F)
where
    I: Accept,
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    loop {
        let stream = tokio::select! {
            accepted = incoming.next_conn() => match accepted {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
            _ = &mut shutdown => break,
        };

        let io = TokioIo::new(stream);
        let app = Arc::clone(&app);

        tokio::task::spawn(async move {
            if let Err(err) = http1::Builder::new()
                .keep_alive(true)
                .half_close(false)
                .writev(true)
                .max_buf_size(16 * 1024)
                .serve_connection(io, service_fn(move |req| routes::route(req, Arc::clone(&app))))
                .await
            {
                tracing::debug!(error = ?err, "Error serving connection");
            }
        });
    }

    tracing::warn!("Shutting down");
    app.drain().await;
}

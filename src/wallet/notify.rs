//! Local webhook phored calls through `-walletnotify`.

use axum::{extract::State, http::StatusCode, routing::post, Router};
use log::{debug, warn};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::error::Result;

#[derive(Clone)]
struct NotifyState {
    txids: mpsc::UnboundedSender<String>,
}

/// `POST /` with the txid as the body.
pub fn router(txids: mpsc::UnboundedSender<String>) -> Router {
    Router::new()
        .route("/", post(handle_notify))
        .with_state(NotifyState { txids })
}

pub async fn bind(port: u16) -> Result<TcpListener> {
    Ok(TcpListener::bind(("127.0.0.1", port)).await?)
}

pub async fn serve(listener: TcpListener, txids: mpsc::UnboundedSender<String>) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        debug!("walletnotify listening on http://{}", addr);
    }
    axum::serve(listener, router(txids)).await?;
    Ok(())
}

async fn handle_notify(State(state): State<NotifyState>, body: String) -> StatusCode {
    let txid = body.trim();
    if txid.len() != 64 || hex::decode(txid).is_err() {
        warn!("walletnotify with malformed txid {:?}", txid);
        return StatusCode::BAD_REQUEST;
    }
    debug!("walletnotify {}", txid);
    match state.txids.send(txid.to_string()) {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use console::style;
use serde::Serialize;
use tower_http::services::ServeDir;
use tracing::info;

use crate::error::GateError;
use crate::executor::Outputs;
use crate::parser::parse;
use crate::supervisor::{Status, Supervisor};

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct StateBody {
    pub running: bool,
}

/// Serves the HTTP front end on a background thread.
pub fn start(supervisor: Arc<Supervisor>, port: u16) -> thread::JoinHandle<Result<(), anyhow::Error>> {
    info!(url = %style(format!("http://localhost:{port}/")).yellow(), "starting a HTTP server");

    thread::spawn(move || {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
            .block_on(serve(supervisor, port))
    })
}

pub async fn serve(supervisor: Arc<Supervisor>, port: u16) -> Result<(), anyhow::Error> {
    let address = SocketAddr::from(([127, 0, 0, 1], port));
    let address = tokio::net::TcpListener::bind(address).await?;

    axum::serve(address, router(supervisor)).await?;

    Ok(())
}

pub fn router(supervisor: Arc<Supervisor>) -> Router {
    // cached node outputs, read-only
    let outputs = ServeDir::new(supervisor.engine().store().root().as_std_path());

    Router::new()
        .route("/exec", post(exec))
        .route("/state", get(state))
        .route("/cancel", post(cancel))
        .route("/last", get(last))
        .nest_service("/outputs", outputs)
        .with_state(supervisor)
}

async fn exec(State(supervisor): State<Arc<Supervisor>>, query: String) -> (StatusCode, String) {
    let graph = match parse(&query) {
        Ok(graph) => graph,
        Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()),
    };

    match supervisor.start(graph) {
        Ok(()) => (StatusCode::ACCEPTED, "started".to_string()),
        Err(err @ GateError::Busy) => (StatusCode::CONFLICT, err.to_string()),
        Err(err @ GateError::Spawn(_)) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn state(State(supervisor): State<Arc<Supervisor>>) -> Json<StateBody> {
    Json(StateBody {
        running: supervisor.status() == Status::Running,
    })
}

async fn cancel(State(supervisor): State<Arc<Supervisor>>) -> StatusCode {
    if supervisor.cancel() {
        StatusCode::ACCEPTED
    } else {
        StatusCode::CONFLICT
    }
}

async fn last(State(supervisor): State<Arc<Supervisor>>) -> Result<Json<Outputs>, StatusCode> {
    supervisor
        .last_outputs()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

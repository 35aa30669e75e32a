use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    middleware,
    response::IntoResponse,
    routing::{delete, get, patch, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use matchpoint_api::middleware::require_auth;
use matchpoint_api::state::{AppState, AppStateInner};
use matchpoint_api::{conversations, messages, reactions, read_receipts};
use matchpoint_db::{Database, StoreOptions};
use matchpoint_gateway::connection;
use matchpoint_gateway::dispatcher::Dispatcher;

#[derive(Clone)]
struct ServerState {
    dispatcher: Dispatcher,
    jwt_secret: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "matchpoint=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("MATCHPOINT_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("MATCHPOINT_DB_PATH").unwrap_or_else(|_| "matchpoint.db".into());
    let host = std::env::var("MATCHPOINT_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("MATCHPOINT_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;
    let edit_window_mins: i64 = std::env::var("MATCHPOINT_EDIT_WINDOW_MINS")
        .unwrap_or_else(|_| "15".into())
        .parse()?;

    // Init database
    let db = Database::open_with(
        &PathBuf::from(&db_path),
        StoreOptions {
            edit_window: chrono::Duration::minutes(edit_window_mins),
        },
    )?;

    // Shared state
    let dispatcher = Dispatcher::new();
    let app_state: AppState = Arc::new(AppStateInner {
        db,
        dispatcher: dispatcher.clone(),
        jwt_secret: jwt_secret.clone(),
    });

    // Routes
    let public_routes = Router::new().route("/health", get(health));

    let protected_routes = Router::new()
        .route("/conversations", post(conversations::create_conversation))
        .route("/conversations", get(conversations::list_conversations))
        .route("/conversations/direct", post(conversations::get_or_create_direct))
        .route("/conversations/{conversation_id}", get(conversations::get_conversation))
        .route("/conversations/{conversation_id}/participants", post(conversations::add_participant))
        .route("/conversations/{conversation_id}/participants/{user_id}", delete(conversations::remove_participant))
        .route("/conversations/{conversation_id}/read", post(read_receipts::touch_read))
        .route("/conversations/{conversation_id}/messages", get(messages::get_messages))
        .route("/conversations/{conversation_id}/messages", post(messages::send_message))
        .route("/conversations/{conversation_id}/messages/{message_id}", patch(messages::edit_message))
        .route("/conversations/{conversation_id}/messages/{message_id}", delete(messages::delete_message))
        .route("/conversations/{conversation_id}/messages/{message_id}/read", post(read_receipts::mark_read))
        .route("/conversations/{conversation_id}/messages/{message_id}/reactions", post(reactions::toggle_reaction))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_auth))
        .with_state(app_state);

    let ws_state = ServerState {
        dispatcher,
        jwt_secret,
    };
    let ws_route = Router::new().route("/gateway", get(ws_upgrade)).with_state(ws_state);

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Matchpoint messaging server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health() -> impl IntoResponse {
    "ok"
}

async fn ws_upgrade(State(state): State<ServerState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, state.dispatcher, state.jwt_secret)
    })
}

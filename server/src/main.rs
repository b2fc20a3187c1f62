mod config;
mod message;
mod routes;
mod services;
mod state;

use services::ticket::TicketVerifier;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = config::Config::from_env();
    let verifier = TicketVerifier::from_env(config.production);
    let port = config.port;
    let state = state::AppState::new(config, verifier);

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "colab backend listening");
    axum::serve(listener, app).await.expect("server failed");
}

mod config;
mod error;
mod frame;
mod rate_limit;
mod routes;
mod services;
mod state;

use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = config::BrokerConfig::from_env().expect("invalid broker configuration");

    let secret = match &config.auth_secret {
        Some(secret) => secret.clone(),
        None => {
            tracing::warn!("AUTH_SECRET not set; using a random per-process key, issued tokens die with this process");
            services::auth::generate_secret()
        }
    };
    let auth = services::auth::Authenticator::new(secret, config.allow_anonymous);

    let listen = config.listen;
    tracing::info!(
        grace_ms = config.grace_window.as_millis(),
        room_grace_ms = config.room_grace.as_millis(),
        backlog = config.member_backlog,
        retained = config.retained_events,
        echo = config.echo_to_originator,
        anonymous = config.allow_anonymous,
        dev_tokens = config.dev_token_issuer,
        "broker configured"
    );
    let state = state::AppState::new(config, auth);

    // Reap expired sessions and destroy idle rooms.
    let _sweeper = services::supervisor::spawn_sweeper(state.clone());

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .expect("failed to bind");

    tracing::info!(%listen, "sketchroom listening");
    axum::serve(listener, app).await.expect("server failed");
}

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;

use axum::routing::{delete, get};
use axum::Router;
use log::info;
use tower_http::services::ServeDir;

use crate::api::routes;
use crate::relay::RelayHandle;

#[derive(Clone)]
pub struct ApiState {
    pub relay: RelayHandle,
    pub recordings_dir: PathBuf,
    pub static_dir: PathBuf,
}

pub fn router(state: ApiState) -> Router {
    let recordings = ServeDir::new(&state.recordings_dir);
    let ui = ServeDir::new(&state.static_dir).append_index_html_on_directories(true);

    Router::new()
        .route(
            "/api/config",
            get(routes::config::get_config).post(routes::config::post_config),
        )
        .route("/api/status", get(routes::status::get_status))
        .route("/api/recordings", get(routes::recordings::list))
        .route("/api/recordings/:filename", delete(routes::recordings::remove))
        .route("/ws", get(routes::websocket::websocket_handler))
        .nest_service("/recordings", recordings)
        .fallback_service(ui)
        .with_state(state)
}

pub async fn serve<F>(bind_addr: SocketAddr, state: ApiState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!("[api] server listening on {}", bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("[api] server stopped");
    Ok(())
}

//! HTTP surface: REST endpoints in [`api`], the live board feed in [`ws`].

pub mod api;
pub mod ws;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::config::TrilhaConfig;
use crate::pipeline::Services;
use crate::pipeline::clock::SystemClock;
use crate::pipeline::db::{DbHandle, PipelineDb};
use api::{AppState, SharedState};

/// Build the full router: REST API plus the `/ws` board feed.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

/// Open the configured database and wire the engine around it.
pub fn open_services(config: &TrilhaConfig) -> Result<Services> {
    let db_path = &config.server.db_path;
    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = PipelineDb::new(db_path)
        .with_context(|| format!("Failed to open pipeline database {}", db_path.display()))?;

    let settings = config.pipeline_settings();
    let clock = Arc::new(SystemClock::new(settings.utc_offset_minutes.unwrap_or(0)));
    Ok(Services::sqlite(
        DbHandle::new(db),
        settings,
        clock,
        Arc::new(config.occupancy_map()),
        Arc::new(config.composer()),
        config.server.broadcast_capacity,
    ))
}

pub async fn start_server(config: TrilhaConfig) -> Result<()> {
    let services = open_services(&config)?;
    let state = Arc::new(AppState {
        services,
        views: config.views(),
    });

    let mut app = build_router(state);
    if config.server.cors_permissive {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, db = %config.server.db_path.display(), "Trilha listening");
    println!("Trilha running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::board::BoardView;
    use crate::pipeline::testing::{local, services_at};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn test_router() -> Router {
        let (services, _clock) = services_at(local(2025, 3, 11, 9, 0));
        build_router(Arc::new(AppState {
            services,
            views: BoardView::presets(),
        }))
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let app = test_router();
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_routes_mounted() {
        let app = test_router();
        let req = Request::builder()
            .uri("/api/views")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    type Client = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    async fn spawn_server() -> (std::net::SocketAddr, Services) {
        let (services, _clock) = services_at(local(2025, 3, 11, 9, 0));
        let app = build_router(Arc::new(AppState {
            services: services.clone(),
            views: BoardView::presets(),
        }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, services)
    }

    async fn next_json(ws: &mut Client) -> serde_json::Value {
        use futures_util::StreamExt;
        use tokio_tungstenite::tungstenite::Message as Frame;
        loop {
            let frame = tokio::time::timeout(std::time::Duration::from_secs(2), ws.next())
                .await
                .expect("frame in time")
                .expect("socket open")
                .expect("valid frame");
            if let Frame::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_ws_rejects_unknown_view() {
        let (addr, _services) = spawn_server().await;
        let result =
            tokio_tungstenite::connect_async(format!("ws://{}/ws?view=nowhere", addr)).await;
        match result {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status().as_u16(), 404);
            }
            Err(other) => panic!("expected HTTP 404, got {:?}", other),
            Ok(_) => panic!("upgrade should be refused for an unknown view"),
        }
    }

    #[tokio::test]
    async fn test_ws_snapshot_then_updates_survive_bad_switch() {
        use futures_util::SinkExt;
        use tokio_tungstenite::tungstenite::Message as Frame;

        let (addr, services) = spawn_server().await;
        let (mut ws, _) =
            tokio_tungstenite::connect_async(format!("ws://{}/ws?view=entrada", addr))
                .await
                .unwrap();

        let first = next_json(&mut ws).await;
        assert_eq!(first["type"], "Snapshot");
        assert_eq!(first["data"]["snapshot"]["view"]["name"], "entrada");

        ws.send(Frame::Text(
            r#"{"type":"SwitchView","view":"nowhere"}"#.to_string(),
        ))
        .await
        .unwrap();
        let error = next_json(&mut ws).await;
        assert_eq!(error["type"], "Error");

        services
            .coordinator()
            .open_case(
                trilha_common::NewCase {
                    patient: trilha_common::PatientInfo {
                        name: "Maria Souza".into(),
                        ..Default::default()
                    },
                    ..Default::default()
                },
                &trilha_common::Actor::new("u1", "Recepção"),
            )
            .await
            .unwrap();
        let update = next_json(&mut ws).await;
        assert_eq!(update["type"], "Update");
        assert_eq!(update["data"]["update"]["type"], "CardUpserted");
        assert_eq!(update["data"]["update"]["data"]["column"], "intake-documents");
    }

    #[test]
    fn test_open_services_creates_db_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = TrilhaConfig::default();
        config.server.db_path = dir.path().join("nested").join("trilha.db");
        open_services(&config).unwrap();
        assert!(dir.path().join("nested").join("trilha.db").exists());
    }
}

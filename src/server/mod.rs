//! HTTP API over the fleet monitor.
//!
//! Read endpoints only touch the status cache. `POST /api/refresh` joins or
//! starts a scan cycle and answers when it has committed.

use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::fleet::{FleetError, FleetMonitor, FleetStats};
use crate::status::StatusFilter;

type AppState = Arc<FleetMonitor>;

// ── Errors ──────────────────────────────────────────────────────────

/// Error body is `{"detail": "..."}`.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self { status, detail: detail.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

impl From<FleetError> for ApiError {
    fn from(e: FleetError) -> Self {
        match &e {
            FleetError::SiteNotFound(_) => Self::new(StatusCode::NOT_FOUND, e.to_string()),
            FleetError::Persist(_) => {
                error!(error = %e, "Inventory update failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
            FleetError::Scan(_) => {
                error!(error = %e, "Refresh failed");
                Self::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            }
        }
    }
}

// ── Request / Response Types ────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct StatusQuery {
    status: Option<String>,
}

impl StatusQuery {
    fn filter(&self) -> Result<StatusFilter, ApiError> {
        match self.status.as_deref() {
            None => Ok(StatusFilter::All),
            Some(s) => s.parse::<StatusFilter>().map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SiteQuery {
    site: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateSerialRequest {
    site: Option<String>,
    #[serde(rename = "p2pNumber")]
    p2p_number: Option<String>,
}

#[derive(Debug, Serialize)]
struct RefreshResponse {
    ok: bool,
    #[serde(flatten)]
    stats: FleetStats,
}

// ── Routes ──────────────────────────────────────────────────────────

pub fn router(fleet: Arc<FleetMonitor>) -> Router {
    Router::new()
        .route("/", get(banner))
        .route("/api/stats", get(stats))
        .route("/api/dvrs", get(list_dvrs))
        .route("/api/search", get(search))
        .route("/api/update-p2p", post(update_p2p))
        .route("/api/refresh", post(refresh))
        .route("/api/download.csv", get(download_csv))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(fleet)
}

/// Serve until `shutdown` fires.
pub async fn serve(listen: &str, fleet: Arc<FleetMonitor>, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind HTTP listener on {}", listen))?;
    info!("🌐 HTTP API listening on {}", listener.local_addr()?);

    axum::serve(listener, router(fleet))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server failed")?;

    info!("HTTP API stopped");
    Ok(())
}

async fn banner() -> Json<serde_json::Value> {
    Json(json!({
        "message": "dvrwatch API is running.",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn stats(State(fleet): State<AppState>) -> Json<FleetStats> {
    Json(fleet.get_stats())
}

async fn list_dvrs(
    State(fleet): State<AppState>,
    Query(q): Query<StatusQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let items = fleet.list_by_status(q.filter()?);
    Ok(Json(json!({ "items": items })))
}

async fn search(State(fleet): State<AppState>, Query(q): Query<SiteQuery>) -> Result<impl IntoResponse, ApiError> {
    let site = q
        .site
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "Missing 'site'"))?;
    Ok(Json(fleet.find_by_site(&site)?))
}

async fn update_p2p(
    State(fleet): State<AppState>,
    Json(req): Json<UpdateSerialRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (site, serial) = match (req.site, req.p2p_number) {
        (Some(site), Some(serial)) if !site.trim().is_empty() => (site, serial),
        _ => return Err(ApiError::new(StatusCode::BAD_REQUEST, "Missing 'site' or 'p2pNumber'")),
    };

    // Rewrites the inventory file.
    tokio::task::spawn_blocking(move || fleet.update_serial(&site, &serial))
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))??;

    Ok(Json(json!({ "ok": true })))
}

async fn refresh(State(fleet): State<AppState>) -> Result<Json<RefreshResponse>, ApiError> {
    let stats = fleet.trigger_refresh().await?;
    Ok(Json(RefreshResponse { ok: true, stats }))
}

async fn download_csv(
    State(fleet): State<AppState>,
    Query(q): Query<StatusQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = q.filter()?;
    let body = fleet.export_csv(filter);
    let disposition = format!("attachment; filename=dvrs_{}.csv", filter.as_str());
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{parse_inventory, Inventory};
    use crate::scanner::testing::{FakeProber, FakeResolver};
    use crate::scanner::Scanner;
    use crate::status::StatusCache;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use tower::ServiceExt;

    const INVENTORY: &str = "P2P NUMBER,SITE,STORE NAME\nAAA,S1,Alpha\nBBB,S2,Beta\n,S3,Gamma\n";

    fn app() -> Router {
        let inventory = Arc::new(Inventory::from_rows(parse_inventory(INVENTORY).unwrap()));
        let cache = Arc::new(StatusCache::new());
        let scanner = Arc::new(Scanner::new(
            inventory.clone(),
            cache.clone(),
            FakeResolver::not_found(&["BBB"]),
            FakeProber::instant(),
            2,
            CancellationToken::new(),
        ));
        router(Arc::new(FleetMonitor::new(inventory, cache, scanner)))
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<serde_json::Value>) -> Response {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(v) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(v.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        app.clone().oneshot(request).await.unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        serde_json::from_str(&body_text(response).await).unwrap()
    }

    #[tokio::test]
    async fn test_stats_before_first_scan() {
        let app = app();
        let resp = send(&app, Method::GET, "/api/stats", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            body_json(resp).await,
            json!({"total": 3, "online": 0, "offline": 3, "lastUpdated": null})
        );
    }

    #[tokio::test]
    async fn test_refresh_returns_fresh_stats() {
        let app = app();
        let resp = send(&app, Method::POST, "/api/refresh", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["ok"], true);
        assert_eq!((json["total"].clone(), json["online"].clone(), json["offline"].clone()), (json!(3), json!(1), json!(2)));
        assert!(json["lastUpdated"].is_string());
    }

    #[tokio::test]
    async fn test_dvrs_filter() {
        let app = app();
        send(&app, Method::POST, "/api/refresh", None).await;

        let json = body_json(send(&app, Method::GET, "/api/dvrs?status=online", None).await).await;
        assert_eq!(
            json,
            json!({"items": [{"P2P NUMBER": "AAA", "SITE": "S1", "STORE NAME": "Alpha", "status": "online"}]})
        );

        let resp = send(&app, Method::GET, "/api/dvrs?status=stale", None).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_search_not_found() {
        let app = app();
        let resp = send(&app, Method::GET, "/api/search?site=S9", None).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await, json!({"detail": "SITE not found"}));

        let resp = send(&app, Method::GET, "/api/search?site=S2", None).await;
        assert_eq!(body_json(resp).await["P2P NUMBER"], "BBB");
    }

    #[tokio::test]
    async fn test_update_p2p() {
        let app = app();
        let resp = send(&app, Method::POST, "/api/update-p2p", Some(json!({"site": "S3", "p2pNumber": "NEW1"}))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, json!({"ok": true}));

        let json = body_json(send(&app, Method::GET, "/api/search?site=S3", None).await).await;
        assert_eq!(json["P2P NUMBER"], "NEW1");
        assert_eq!(json["status"], "unknown");

        let resp = send(&app, Method::POST, "/api/update-p2p", Some(json!({"site": "S3"}))).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = send(&app, Method::POST, "/api/update-p2p", Some(json!({"site": "S9", "p2pNumber": "X"}))).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_download_csv() {
        let app = app();
        send(&app, Method::POST, "/api/refresh", None).await;

        let resp = send(&app, Method::GET, "/api/download.csv?status=offline", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=dvrs_offline.csv"
        );
        assert_eq!(body_text(resp).await, "P2P NUMBER,SITE,STORE NAME\nBBB,S2,Beta\n,S3,Gamma\n");
    }

    #[tokio::test]
    async fn test_cors_headers_present() {
        let app = app();
        let request = Request::builder()
            .uri("/api/stats")
            .header("Origin", "http://localhost:5173")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(request).await.unwrap();
        assert!(resp.headers().contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
    }
}

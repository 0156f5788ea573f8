use crate::andon_logic::model::{ConnectionStatus, ErrorReport, HealthReport, StatusReport};
use crate::andon_logic::state::ServerState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use lib_andon::core::reports::DEFAULT_STATS_DAYS;
use lib_andon::telemetry::FaultRecord;
use lib_andon::{DashboardSummary, DowntimeRow, StationStats, StoreError, TelemetryStore};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

static NEXT_CLIENT_ID: AtomicUsize = AtomicUsize::new(1);

type ReportResult<T> = Result<Json<T>, (StatusCode, Json<ErrorReport>)>;

#[derive(Debug, Deserialize)]
struct SectionQuery {
    date: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    days: Option<u32>,
}

pub fn router<S: TelemetryStore>(state: ServerState<S>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler::<S>))
        .route("/health", get(health_handler::<S>))
        .route("/status", get(status_handler::<S>))
        .route("/stations", get(stations_handler::<S>))
        .route("/data/dailyrecord", get(daily_record_handler::<S>))
        .route("/data/sectiondata", get(section_data_handler::<S>))
        .route("/station/{id}/stats", get(station_stats_handler::<S>))
        .route("/dashboard/summary", get(dashboard_summary_handler::<S>))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run<S: TelemetryStore>(port: u16, state: ServerState<S>) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(&addr).await?;
    log::info!("Downstream server listening on {}", addr);
    serve(listener, state).await
}

/// Serves on an already bound listener until the shutdown token fires.
pub async fn serve<S: TelemetryStore>(listener: TcpListener, state: ServerState<S>) -> anyhow::Result<()> {
    let shutdown = state.shutdown.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            log::info!("Downstream server shutting down.");
        })
        .await?;
    Ok(())
}

async fn ws_handler<S: TelemetryStore>(ws: WebSocketUpgrade, State(state): State<ServerState<S>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn health_handler<S: TelemetryStore>(State(state): State<ServerState<S>>) -> impl IntoResponse {
    Json(HealthReport {
        status: "OK",
        timestamp: chrono::Utc::now().to_rfc3339(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

async fn status_handler<S: TelemetryStore>(State(state): State<ServerState<S>>) -> impl IntoResponse {
    Json(StatusReport {
        transport: state.transport.snapshot(),
        sequencer: state.sequencer.stats(),
        subscribers: state.dispatcher.client_count(),
        dropped_events: state.dispatcher.dropped_total(),
    })
}

async fn stations_handler<S: TelemetryStore>(State(state): State<ServerState<S>>) -> impl IntoResponse {
    Json(state.sequencer.board().snapshot())
}

/// Logs the store failure and answers with a 500 that names what could not be read.
fn report_failure(what: &str, e: StoreError) -> (StatusCode, Json<ErrorReport>) {
    log::error!("Failed to fetch {}: {}", what, e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorReport::new(format!("Failed to fetch {}", what))),
    )
}

async fn daily_record_handler<S: TelemetryStore>(State(state): State<ServerState<S>>) -> ReportResult<Vec<DowntimeRow>> {
    state
        .reports
        .daily_records()
        .await
        .map(Json)
        .map_err(|e| report_failure("daily records", e))
}

/// Fault records, optionally only those opened on `?date=YYYY-MM-DD` (plant day).
async fn section_data_handler<S: TelemetryStore>(
    State(state): State<ServerState<S>>,
    Query(query): Query<SectionQuery>,
) -> ReportResult<Vec<FaultRecord>> {
    state
        .reports
        .fault_history(query.date)
        .await
        .map(Json)
        .map_err(|e| report_failure("fault records", e))
}

async fn station_stats_handler<S: TelemetryStore>(
    State(state): State<ServerState<S>>,
    Path(station_id): Path<String>,
    Query(query): Query<StatsQuery>,
) -> ReportResult<StationStats> {
    let days = query.days.unwrap_or(DEFAULT_STATS_DAYS);
    match state.reports.station_stats(&station_id, days, chrono::Utc::now()).await {
        Ok(Some(stats)) => Ok(Json(stats)),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorReport::new(format!("Station {} not found", station_id))),
        )),
        Err(e) => Err(report_failure("station statistics", e)),
    }
}

async fn dashboard_summary_handler<S: TelemetryStore>(
    State(state): State<ServerState<S>>,
) -> ReportResult<DashboardSummary> {
    state
        .reports
        .dashboard_summary(chrono::Utc::now())
        .await
        .map(Json)
        .map_err(|e| report_failure("dashboard summary", e))
}

async fn handle_socket<S: TelemetryStore>(mut socket: WebSocket, state: ServerState<S>) {
    let client_id = format!("ws-{}", NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed));
    let mut updates = state.dispatcher.add_client(&client_id);
    log::info!("Client {} connected", client_id);

    match serde_json::to_string(&ConnectionStatus::connected()) {
        Ok(greeting) => {
            if socket.send(Message::Text(greeting.into())).await.is_err() {
                state.dispatcher.remove_client(&client_id);
                return;
            }
        }
        Err(e) => log::error!("Failed to encode connection status: {}", e),
    }

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            // Dashboards only listen; anything they send besides Close is ignored
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
            delivery = updates.recv() => {
                let Some(delivery) = delivery else {
                    break;
                };
                let messages = match delivery.to_json_messages() {
                    Ok(messages) => messages,
                    Err(e) => {
                        log::error!("Failed to encode update for {}: {}", client_id, e);
                        continue;
                    }
                };
                let mut sent = true;
                for text in messages {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        sent = false;
                        break;
                    }
                }
                if !sent {
                    break; // client disconnected
                }
            }
        }
    }

    state.dispatcher.remove_client(&client_id);
    log::info!("Client {} disconnected", client_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use lib_andon::{Dispatcher, MemoryStore, RawFrame, Reports, Sequencer, StationLayout, TransportStatus};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::sync::CancellationToken;

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n", path);
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_health_status_and_stations_routes() {
        let store = Arc::new(MemoryStore::default());
        let dispatcher = Arc::new(Dispatcher::default());
        let layout = StationLayout::default();
        let reports = Reports::new(Arc::clone(&store), layout.categories().clone(), chrono_tz::UTC);
        let (mut sequencer, handle) = Sequencer::new(layout, chrono_tz::UTC, store, Arc::clone(&dispatcher));
        sequencer
            .process(RawFrame::new("12", "{1,0,1,5,0,0,1,0,1,0,1,0,1,0,1,0}", chrono::Utc::now()))
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let state = ServerState::new(
            dispatcher,
            handle,
            Arc::new(TransportStatus::default()),
            reports,
            shutdown.clone(),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve(listener, state));

        let health = get(addr, "/health").await;
        assert!(health.starts_with("HTTP/1.1 200"), "{}", health);
        assert!(health.contains(r#""status":"OK""#));
        assert!(health.contains("uptimeSeconds"));

        let status = get(addr, "/status").await;
        assert!(status.contains(r#""processed":1"#), "{}", status);
        assert!(status.contains(r#""connected":false"#));

        let stations = get(addr, "/stations").await;
        assert!(stations.contains(r#""stationId":"12""#), "{}", stations);
        assert!(stations.contains(r#""productionCount":5"#));
        assert!(stations.contains(r#""openFaults":["Production"]"#));

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_report_routes() {
        let store = Arc::new(MemoryStore::default());
        let dispatcher = Arc::new(Dispatcher::default());
        let layout = StationLayout::default();
        let reports = Reports::new(Arc::clone(&store), layout.categories().clone(), chrono_tz::UTC);
        let (mut sequencer, handle) = Sequencer::new(layout, chrono_tz::UTC, store, Arc::clone(&dispatcher));
        // Production held for two minutes on station 12
        let opened = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let cleared = Utc.with_ymd_and_hms(2024, 3, 1, 10, 2, 0).unwrap();
        sequencer
            .process(RawFrame::new("12", "{1,0,1,5,0,0,1,0,1,0,1,0,1,0,1,0}", opened))
            .await
            .unwrap();
        sequencer
            .process(RawFrame::new("12", "{1,0,1,7,1,0,1,0,1,0,1,0,1,0,1,0}", cleared))
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let state = ServerState::new(
            dispatcher,
            handle,
            Arc::new(TransportStatus::default()),
            reports,
            shutdown.clone(),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve(listener, state));

        let daily = get(addr, "/data/dailyrecord").await;
        assert!(daily.starts_with("HTTP/1.1 200"), "{}", daily);
        assert!(daily.contains(r#""day":"2024-03-01""#), "{}", daily);
        assert!(daily.contains(r#""minutes":2.0"#), "{}", daily);

        let section = get(addr, "/data/sectiondata?date=2024-03-01").await;
        assert!(section.contains(r#""category":"Production""#), "{}", section);
        assert!(section.contains(r#""closedAt":"#));
        let other_day = get(addr, "/data/sectiondata?date=2024-03-02").await;
        assert!(other_day.ends_with("[]"), "{}", other_day);
        let bad_date = get(addr, "/data/sectiondata?date=yesterday").await;
        assert!(bad_date.starts_with("HTTP/1.1 400"), "{}", bad_date);

        let stats = get(addr, "/station/12/stats?days=3").await;
        assert!(stats.starts_with("HTTP/1.1 200"), "{}", stats);
        assert!(stats.contains(r#""stationId":"12""#));
        assert!(stats.contains(r#""days":3"#));
        assert!(stats.contains(r#""actualCount":7"#));

        let missing = get(addr, "/station/99/stats").await;
        assert!(missing.starts_with("HTTP/1.1 404"), "{}", missing);
        assert!(missing.contains(r#""error":"Station 99 not found""#));

        let summary = get(addr, "/dashboard/summary").await;
        assert!(summary.starts_with("HTTP/1.1 200"), "{}", summary);
        assert!(summary.contains(r#""totalStations":1"#), "{}", summary);
        assert!(summary.contains(r#""activeFaults":0"#));
        assert!(summary.contains(r#""faultsByType":{"#));

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}

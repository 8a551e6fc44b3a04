//! HTTP handlers
//!
//! Thin translation between JSON and the driver/façade calls. Every error is
//! rendered through [`AppError`], which takes its status from the service
//! error's category.

use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use common::{AppError, SuccessResponse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::routes::AppState;
use crate::facade::{PointDescriptor, PointReading};
use crate::lifecycle::DriverStatus;
use crate::point_map::PointValue;
use crate::store::{CellSnapshot, Quality, Table};

type ApiResult<T> = Result<Json<SuccessResponse<T>>, AppError>;

/// Health check payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub service: String,
    pub version: String,
    pub driver_running: bool,
}

/// Body of `PUT /api/points/{name}`
#[derive(Debug, Clone, Deserialize)]
pub struct WritePointRequest {
    pub value: PointValue,
}

/// Query of `GET /api/registers/{table}`
#[derive(Debug, Clone, Deserialize)]
pub struct RangeQuery {
    #[serde(default)]
    pub start: u16,
    #[serde(default = "default_count")]
    pub count: usize,
}

fn default_count() -> usize {
    1
}

/// Query of `PUT /api/registers/{table}`
#[derive(Debug, Clone, Deserialize)]
pub struct StartQuery {
    #[serde(default)]
    pub start: u16,
}

/// Body of `PUT /api/registers/{table}`
#[derive(Debug, Clone, Deserialize)]
pub struct WriteRegistersRequest {
    pub values: Vec<u16>,
}

/// Body of `PUT /api/registers/{table}/quality`
#[derive(Debug, Clone, Deserialize)]
pub struct QualityRequest {
    pub quality: Quality,
}

/// Query of `GET /api/registers/{table}/changes`
#[derive(Debug, Clone, Deserialize)]
pub struct ChangesQuery {
    pub since: DateTime<Utc>,
}

fn parse_table(table: &str) -> Result<Table, AppError> {
    table.parse::<Table>().map_err(AppError::bad_request)
}

/// Health check endpoint
///
/// @route GET /health
/// @output `Json<SuccessResponse<HealthStatus>>`
/// @status 200 - Service is up (the Modbus driver may be stopped)
pub async fn health_check(State(state): State<AppState>) -> ApiResult<HealthStatus> {
    Ok(Json(SuccessResponse::new(HealthStatus {
        status: "healthy".to_string(),
        service: "mbsrv".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        driver_running: state.driver.status().running,
    })))
}

/// Driver status
///
/// @route GET /api/status
/// @output `Json<SuccessResponse<DriverStatus>>` - state, uptime, counters, clients
pub async fn get_status(State(state): State<AppState>) -> ApiResult<DriverStatus> {
    Ok(Json(SuccessResponse::new(state.driver.status())))
}

/// Start the Modbus server
///
/// @route POST /api/start
/// @status 200 - Running (also when it already was)
/// @status 409 - Listen address unavailable
pub async fn start_driver(State(state): State<AppState>) -> ApiResult<DriverStatus> {
    state
        .driver
        .start()
        .await
        .map_err(|e| AppError::from_service_error(&e))?;
    Ok(Json(SuccessResponse::new(state.driver.status())))
}

/// Stop the Modbus server
///
/// @route POST /api/stop
/// @status 200 - Stopped (also when it already was)
pub async fn stop_driver(State(state): State<AppState>) -> ApiResult<DriverStatus> {
    state
        .driver
        .stop()
        .await
        .map_err(|e| AppError::from_service_error(&e))?;
    Ok(Json(SuccessResponse::new(state.driver.status())))
}

/// Restart the Modbus server
///
/// @route POST /api/restart
/// @status 200 - Running again
/// @status 409 - Listen address unavailable
pub async fn restart_driver(State(state): State<AppState>) -> ApiResult<DriverStatus> {
    state
        .driver
        .restart()
        .await
        .map_err(|e| AppError::from_service_error(&e))?;
    Ok(Json(SuccessResponse::new(state.driver.status())))
}

/// Toggle debug logging
///
/// @route POST /api/debug/{on|off}
/// @status 400 - Mode is neither `on` nor `off`
pub async fn set_debug(
    State(state): State<AppState>,
    Path(mode): Path<String>,
) -> ApiResult<DriverStatus> {
    let enabled = match mode.as_str() {
        "on" => true,
        "off" => false,
        other => {
            return Err(AppError::bad_request(format!(
                "debug mode must be 'on' or 'off', got '{}'",
                other
            )))
        },
    };
    state.driver.set_debug(enabled);
    Ok(Json(SuccessResponse::new(state.driver.status())))
}

/// List configured points
///
/// @route GET /api/points
pub async fn list_points(State(state): State<AppState>) -> ApiResult<Vec<PointDescriptor>> {
    Ok(Json(SuccessResponse::new(
        state.driver.facade().list_points(),
    )))
}

/// Read one point
///
/// @route GET /api/points/{name}
/// @status 404 - Unknown point
pub async fn get_point(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<PointReading> {
    let reading = state
        .driver
        .facade()
        .get_point(&name)
        .map_err(|e| AppError::from_service_error(&e))?;
    Ok(Json(SuccessResponse::new(reading)))
}

/// Write one point, returns the value read back
///
/// @route PUT /api/points/{name}
/// @input Json(WritePointRequest) - `{"value": 235}`, `{"value": [1, 2]}`
/// @status 400 - Value does not fit the point's type or length
/// @status 403 - Read-only table and policy forbids HTTP writes
/// @status 404 - Unknown point
pub async fn set_point(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<WritePointRequest>,
) -> ApiResult<PointReading> {
    let facade = state.driver.facade();
    facade
        .set_point(&name, &req.value)
        .map_err(|e| AppError::from_service_error(&e))?;
    let reading = facade
        .get_point(&name)
        .map_err(|e| AppError::from_service_error(&e))?;
    Ok(Json(SuccessResponse::new(reading)))
}

/// Raw address read
///
/// @route GET /api/registers/{table}?start=&count=
/// @output `metadata.table_size` - number of addresses in the table
/// @status 400 - Unknown table or range outside the table
pub async fn read_registers(
    State(state): State<AppState>,
    Path(table): Path<String>,
    Query(query): Query<RangeQuery>,
) -> ApiResult<Vec<CellSnapshot>> {
    let table = parse_table(&table)?;
    let facade = state.driver.facade();
    let cells = facade
        .read_table(table, query.start, query.count)
        .map_err(|e| AppError::from_service_error(&e))?;
    Ok(Json(
        SuccessResponse::new(cells)
            .with_metadata("table_size", serde_json::json!(facade.table_size(table))),
    ))
}

/// Raw address write
///
/// @route PUT /api/registers/{table}?start=
/// @input Json(WriteRegistersRequest) - `{"values": [5, 6, 7]}`
/// @status 400 - Unknown table or range outside the table
/// @status 403 - Read-only table and policy forbids HTTP writes
pub async fn write_registers(
    State(state): State<AppState>,
    Path(table): Path<String>,
    Query(query): Query<StartQuery>,
    Json(req): Json<WriteRegistersRequest>,
) -> ApiResult<Vec<CellSnapshot>> {
    let table = parse_table(&table)?;
    let facade = state.driver.facade();
    facade
        .write_table(table, query.start, &req.values)
        .map_err(|e| AppError::from_service_error(&e))?;
    let cells = facade
        .read_table(table, query.start, req.values.len())
        .map_err(|e| AppError::from_service_error(&e))?;
    Ok(Json(SuccessResponse::new(cells)))
}

/// Override the quality of a raw range
///
/// @route PUT /api/registers/{table}/quality?start=&count=
/// @input Json(QualityRequest) - `{"quality": "bad"}`
/// @status 400 - Unknown table or range outside the table
pub async fn set_quality(
    State(state): State<AppState>,
    Path(table): Path<String>,
    Query(query): Query<RangeQuery>,
    Json(req): Json<QualityRequest>,
) -> ApiResult<Vec<CellSnapshot>> {
    let table = parse_table(&table)?;
    let facade = state.driver.facade();
    facade
        .set_quality(table, query.start, query.count, req.quality)
        .map_err(|e| AppError::from_service_error(&e))?;
    let cells = facade
        .read_table(table, query.start, query.count)
        .map_err(|e| AppError::from_service_error(&e))?;
    Ok(Json(SuccessResponse::new(cells)))
}

/// Addresses updated after a point in time
///
/// @route GET /api/registers/{table}/changes?since=
/// @output `Json<SuccessResponse<Vec<u16>>>` - ascending addresses
pub async fn changed_since(
    State(state): State<AppState>,
    Path(table): Path<String>,
    Query(query): Query<ChangesQuery>,
) -> ApiResult<Vec<u16>> {
    let table = parse_table(&table)?;
    Ok(Json(SuccessResponse::new(
        state.driver.facade().changed_since(table, query.since),
    )))
}

//! HTTP surface: the query facade over tasks, task configs, images,
//! and changes, plus the thin control endpoints (plan / rerun / NVR
//! tree / auto rules / HLS start) and static file serving for
//! screenshots and playlists.
//!
//! The surface assumes a trusted boundary; there is no authentication
//! here.

use std::sync::Arc;

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::error;

use parkwatch_engine::{PlanRequest, RerunTarget, RunNowOutcome, Scheduler};
use parkwatch_hls::{HlsManager, PLAYLIST_NAME};
use parkwatch_store::{
    BlobStore, ChangeFilter, NewAutoRule, NewChannelConfig, NewNvrConfig, Page, SnapshotFilter,
    Store, TaskFilter, TimeRange,
};
use parkwatch_types::{
    detected_variant, AutoRule, BBox, ChangeRecord, ChannelCode, ExternalDbCoords, NvrConfig,
    ParkingSpace, Task, TaskConfig, TaskStatus,
};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub blobs: Arc<BlobStore>,
    pub scheduler: Scheduler,
    pub hls: HlsManager,
}

pub fn router(state: AppState, hls_root: &std::path::Path, blob_root: &std::path::Path) -> axum::Router {
    use tower_http::services::ServeDir;
    axum::Router::new()
        .route("/api/tasks", get(list_tasks))
        .route("/api/task-configs", get(list_task_configs))
        .route("/api/snapshots", get(list_snapshots))
        .route("/api/images", get(list_images))
        .route("/api/changes", get(list_changes))
        .route("/api/tasks/plan", post(plan_now))
        .route("/api/tasks/rerun", post(rerun))
        .route("/api/nvrs", get(list_nvrs).post(create_nvr))
        .route(
            "/api/nvrs/{id}",
            get(get_nvr).put(update_nvr).delete(delete_nvr),
        )
        .route("/api/nvrs/{id}/channels", post(set_channels))
        .route("/api/rules", get(list_rules).post(create_rule))
        .route("/api/rules/{id}", axum::routing::put(update_rule).delete(delete_rule))
        .route("/api/hls/start", post(hls_start))
        .nest_service("/hls", ServeDir::new(hls_root))
        .nest_service("/screenshots", ServeDir::new(blob_root))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// `InvalidInput` maps to 400; everything else is a 500 with the
/// message in the body.
enum ApiError {
    BadRequest(String),
    Internal(String),
}

type ApiResult<T> = std::result::Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::Internal(m) => {
                error!("api error: {m}");
                (StatusCode::INTERNAL_SERVER_ERROR, m)
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<parkwatch_engine::Error> for ApiError {
    fn from(e: parkwatch_engine::Error) -> Self {
        match e {
            parkwatch_engine::Error::InvalidInput(m) => ApiError::BadRequest(m),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<parkwatch_store::Error> for ApiError {
    fn from(e: parkwatch_store::Error) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<parkwatch_types::Error> for ApiError {
    fn from(e: parkwatch_types::Error) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

/// Flat query-string shape shared by the list endpoints.
#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    date: Option<String>,
    ip: Option<String>,
    ip_prefix: Option<String>,
    channel: Option<String>,
    channel_prefix: Option<String>,
    /// Comma-separated wire values.
    status_in: Option<String>,
    text: Option<String>,
    space_id: Option<String>,
    change_type_in: Option<String>,
    start_ts_min: Option<i64>,
    start_ts_max: Option<i64>,
    end_ts_min: Option<i64>,
    end_ts_max: Option<i64>,
    operation_time_min: Option<i64>,
    operation_time_max: Option<i64>,
    detected_at_min: Option<i64>,
    detected_at_max: Option<i64>,
    status_label: Option<String>,
    missing: Option<bool>,
    #[serde(default)]
    page: u32,
    #[serde(default)]
    page_size: u32,
}

fn parse_statuses(raw: &Option<String>) -> ApiResult<Vec<TaskStatus>> {
    match raw {
        None => Ok(Vec::new()),
        Some(raw) => raw
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| TaskStatus::parse(s.trim()).map_err(ApiError::from))
            .collect(),
    }
}

impl ListQuery {
    fn task_filter(&self) -> ApiResult<TaskFilter> {
        Ok(TaskFilter {
            date: self.date.clone(),
            ip: self.ip.clone(),
            ip_prefix: self.ip_prefix.clone(),
            channel: self.channel.clone(),
            channel_prefix: self.channel_prefix.clone(),
            status_in: parse_statuses(&self.status_in)?,
            text: self.text.clone(),
            start_ts: TimeRange {
                min: self.start_ts_min,
                max: self.start_ts_max,
            },
            end_ts: TimeRange {
                min: self.end_ts_min,
                max: self.end_ts_max,
            },
            operation_time: TimeRange {
                min: self.operation_time_min,
                max: self.operation_time_max,
            },
            page: self.page,
            page_size: self.page_size,
        })
    }
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> ApiResult<Json<Page<Task>>> {
    let filter = q.task_filter()?;
    let page = state.store.clone().run(move |s| s.list_tasks(&filter)).await?;
    Ok(Json(page))
}

async fn list_task_configs(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> ApiResult<Json<Page<TaskConfig>>> {
    let filter = parkwatch_store::TaskConfigFilter {
        date: q.date.clone(),
        channel: q.channel.clone(),
        interval_minutes: None,
        text: q.text.clone(),
        operation_time: TimeRange {
            min: q.operation_time_min,
            max: q.operation_time_max,
        },
        page: q.page,
        page_size: q.page_size,
    };
    let page = state
        .store
        .clone()
        .run(move |s| s.list_task_configs(&filter))
        .await?;
    Ok(Json(page))
}

async fn list_snapshots(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> ApiResult<Json<Page<parkwatch_types::Snapshot>>> {
    let filter = SnapshotFilter {
        date: q.date.clone(),
        ip: q.ip.clone(),
        ip_prefix: q.ip_prefix.clone(),
        channel: q.channel.clone(),
        channel_prefix: q.channel_prefix.clone(),
        detected_at: TimeRange {
            min: q.detected_at_min,
            max: q.detected_at_max,
        },
        page: q.page,
        page_size: q.page_size,
    };
    let page = state
        .store
        .clone()
        .run(move |s| s.list_snapshots(&filter))
        .await?;
    Ok(Json(page))
}

async fn list_changes(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> ApiResult<Json<Page<ChangeRecord>>> {
    let filter = ChangeFilter {
        ip: q.ip.clone(),
        ip_prefix: q.ip_prefix.clone(),
        channel: q.channel.clone(),
        channel_prefix: q.channel_prefix.clone(),
        space_id: q.space_id.clone(),
        change_type_in: q
            .change_type_in
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .filter(|s| !s.is_empty())
                    .map(|s| s.trim().to_string())
                    .collect()
            })
            .unwrap_or_default(),
        detected_at: TimeRange {
            min: q.detected_at_min,
            max: q.detected_at_max,
        },
        page: q.page,
        page_size: q.page_size,
    };
    let page = state
        .store
        .clone()
        .run(move |s| s.list_changes(&filter))
        .await?;
    Ok(Json(page))
}

/// One row of the per-day image view: the task, its snapshot if any,
/// and whether the blob actually exists on disk.
#[derive(Debug, Serialize)]
struct ImageRow {
    task: Task,
    status_label: String,
    missing: bool,
    image_url: Option<String>,
    detected_image_url: Option<String>,
}

async fn list_images(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> ApiResult<Json<Page<ImageRow>>> {
    // The image view is per-day so the full day (at most 1440 windows)
    // can be labeled and filtered in memory.
    let date = q
        .date
        .clone()
        .ok_or_else(|| ApiError::BadRequest("date is required for the image view".into()))?;
    let mut filter = q.task_filter()?;
    filter.date = Some(date);
    filter.page = 1;
    filter.page_size = 500;

    // The day fetch, the per-row blob stats, and the label filters all
    // run on the blocking pool in one hop.
    let blobs = state.blobs.clone();
    let wanted_label = q.status_label.clone();
    let wanted_missing = q.missing;
    let labeled: Vec<ImageRow> = state
        .store
        .clone()
        .run(move |s| {
            let mut rows = Vec::new();
            loop {
                let page = s.list_tasks(&filter)?;
                let done = page.items.len() < filter.page_size as usize;
                rows.extend(page.items);
                if done {
                    break;
                }
                filter.page += 1;
            }
            Ok(rows
                .into_iter()
                .map(|task| {
                    let (status_label, missing) = match (task.status, &task.screenshot_path) {
                        (TaskStatus::Pending, _) => ("pending".to_string(), false),
                        (TaskStatus::Playing, _) => ("playing".to_string(), false),
                        (TaskStatus::Failed, _) => ("failed".to_string(), false),
                        (TaskStatus::ScreenshotTaken, Some(rel)) => {
                            if blobs.exists_cached(rel) {
                                ("ok".to_string(), false)
                            } else {
                                ("missing".to_string(), true)
                            }
                        }
                        (TaskStatus::ScreenshotTaken, None) => ("missing".to_string(), true),
                    };
                    let image_url = task
                        .screenshot_path
                        .as_ref()
                        .map(|rel| format!("/screenshots/{rel}"));
                    let detected_image_url = task
                        .screenshot_path
                        .as_ref()
                        .map(|rel| format!("/screenshots/{}", detected_variant(rel)));
                    ImageRow {
                        task,
                        status_label,
                        missing,
                        image_url,
                        detected_image_url,
                    }
                })
                .filter(|row| match &wanted_label {
                    Some(wanted) => &row.status_label == wanted,
                    None => true,
                })
                .filter(|row| match wanted_missing {
                    Some(wanted) => row.missing == wanted,
                    None => true,
                })
                .collect())
        })
        .await?;

    let page = q.page.max(1);
    let page_size = match q.page_size {
        0 => 50,
        n => n.min(500),
    };
    let total = labeled.len() as u64;
    let items = labeled
        .into_iter()
        .skip(((page - 1) * page_size) as usize)
        .take(page_size as usize)
        .collect();
    Ok(Json(Page {
        items,
        total,
        page,
        page_size,
    }))
}

#[derive(Debug, Deserialize)]
struct PlanBody {
    date: String,
    base_rtsp: String,
    channel: String,
    interval_minutes: u32,
}

async fn plan_now(
    State(state): State<AppState>,
    Json(body): Json<PlanBody>,
) -> ApiResult<Json<RunNowOutcome>> {
    let req = PlanRequest {
        day: body.date,
        base_rtsp: body.base_rtsp,
        channel: ChannelCode::parse(&body.channel)?,
        interval_minutes: body.interval_minutes,
    };
    Ok(Json(state.scheduler.run_now(&req).await?))
}

#[derive(Debug, Deserialize)]
struct RerunBody {
    task_id: Option<i64>,
    date: Option<String>,
    ip: Option<String>,
    channel: Option<String>,
}

#[derive(Debug, Serialize)]
struct RerunResponse {
    rearmed: Vec<i64>,
}

async fn rerun(
    State(state): State<AppState>,
    Json(body): Json<RerunBody>,
) -> ApiResult<Json<RerunResponse>> {
    let target = match (body.task_id, body.date) {
        (Some(id), _) => RerunTarget::Task(id),
        (None, Some(date)) => RerunTarget::Matching {
            date,
            ip: body.ip,
            channel: body
                .channel
                .as_deref()
                .map(ChannelCode::parse)
                .transpose()?,
        },
        (None, None) => {
            return Err(ApiError::BadRequest(
                "rerun needs task_id or date".to_string(),
            ))
        }
    };
    let rearmed = state.scheduler.rerun(&target).await?;
    Ok(Json(RerunResponse { rearmed }))
}

#[derive(Debug, Deserialize)]
struct NvrBody {
    site_name: String,
    host: String,
    port: u16,
    user: String,
    password: String,
    external_db: Option<ExternalDbCoords>,
}

impl NvrBody {
    fn into_new(self) -> NewNvrConfig {
        NewNvrConfig {
            site_name: self.site_name,
            host: self.host,
            port: self.port,
            user: self.user,
            password: self.password,
            external_db: self.external_db,
        }
    }
}

async fn list_nvrs(State(state): State<AppState>) -> ApiResult<Json<Vec<NvrConfig>>> {
    let nvrs = state.store.clone().run(|s| s.list_nvrs()).await?;
    Ok(Json(nvrs))
}

async fn get_nvr(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
) -> ApiResult<Json<NvrConfig>> {
    state
        .store
        .clone()
        .run(move |s| s.get_nvr(id))
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::BadRequest(format!("no nvr {id}")))
}

async fn create_nvr(
    State(state): State<AppState>,
    Json(body): Json<NvrBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let new = body.into_new();
    let id = state.store.clone().run(move |s| s.create_nvr(&new)).await?;
    Ok(Json(serde_json::json!({ "id": id })))
}

async fn update_nvr(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
    Json(body): Json<NvrBody>,
) -> ApiResult<StatusCode> {
    let new = body.into_new();
    if state
        .store
        .clone()
        .run(move |s| s.update_nvr(id, &new))
        .await?
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::BadRequest(format!("no nvr {id}")))
    }
}

async fn delete_nvr(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
) -> ApiResult<StatusCode> {
    if state.store.clone().run(move |s| s.delete_nvr(id)).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::BadRequest(format!("no nvr {id}")))
    }
}

#[derive(Debug, Deserialize)]
struct ChannelBody {
    channel_code: String,
    camera_ip: String,
    display_name: String,
    #[serde(default)]
    vendor_sn: String,
    #[serde(default)]
    track_space: String,
    #[serde(default)]
    spaces: Vec<ParkingSpace>,
}

async fn set_channels(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
    Json(body): Json<Vec<ChannelBody>>,
) -> ApiResult<StatusCode> {
    let mut channels = Vec::with_capacity(body.len());
    for ch in body {
        // Deserialization already rejects malformed bboxes; re-check
        // here so no other construction path reaches the store.
        for sp in &ch.spaces {
            BBox::validated(
                sp.bbox.x1 as i64,
                sp.bbox.y1 as i64,
                sp.bbox.x2 as i64,
                sp.bbox.y2 as i64,
            )?;
        }
        channels.push(NewChannelConfig {
            channel_code: ChannelCode::parse(&ch.channel_code)?,
            camera_ip: ch.camera_ip,
            display_name: ch.display_name,
            vendor_sn: ch.vendor_sn,
            track_space: ch.track_space,
            spaces: ch.spaces,
        });
    }
    state
        .store
        .clone()
        .run(move |s| s.set_channels(id, &channels))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct RuleBody {
    #[serde(default)]
    use_today: bool,
    custom_date: Option<String>,
    base_rtsp: String,
    channel: String,
    interval_minutes: u32,
    trigger_time: String,
    #[serde(default = "default_true")]
    is_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl RuleBody {
    fn into_new(self) -> ApiResult<NewAutoRule> {
        // HH:MM, zero-padded.
        let valid = self.trigger_time.len() == 5
            && self.trigger_time.is_ascii()
            && self.trigger_time.as_bytes()[2] == b':'
            && self.trigger_time[..2].parse::<u8>().map(|h| h < 24).unwrap_or(false)
            && self.trigger_time[3..].parse::<u8>().map(|m| m < 60).unwrap_or(false);
        if !valid {
            return Err(ApiError::BadRequest(format!(
                "trigger_time \"{}\" is not HH:MM",
                self.trigger_time
            )));
        }
        Ok(NewAutoRule {
            use_today: self.use_today,
            custom_date: self.custom_date,
            base_rtsp: self.base_rtsp,
            channel: ChannelCode::parse(&self.channel)?,
            interval_minutes: self.interval_minutes,
            trigger_time: self.trigger_time,
            is_enabled: self.is_enabled,
        })
    }
}

async fn list_rules(State(state): State<AppState>) -> ApiResult<Json<Vec<AutoRule>>> {
    let rules = state.store.clone().run(|s| s.list_rules()).await?;
    Ok(Json(rules))
}

async fn create_rule(
    State(state): State<AppState>,
    Json(body): Json<RuleBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let new = body.into_new()?;
    let id = state.store.clone().run(move |s| s.create_rule(&new)).await?;
    Ok(Json(serde_json::json!({ "id": id })))
}

async fn update_rule(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
    Json(body): Json<RuleBody>,
) -> ApiResult<StatusCode> {
    let new = body.into_new()?;
    if state
        .store
        .clone()
        .run(move |s| s.update_rule(id, &new))
        .await?
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::BadRequest(format!("no rule {id}")))
    }
}

async fn delete_rule(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
) -> ApiResult<StatusCode> {
    if state.store.clone().run(move |s| s.delete_rule(id)).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::BadRequest(format!("no rule {id}")))
    }
}

#[derive(Debug, Deserialize)]
struct HlsStartBody {
    rtsp_url: String,
}

async fn hls_start(
    State(state): State<AppState>,
    Json(body): Json<HlsStartBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let playlist = state
        .hls
        .start(&body.rtsp_url)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(serde_json::json!({
        "m3u8": format!("/hls/{}/{PLAYLIST_NAME}", playlist.fingerprint),
    })))
}

//! Axum record API and reporting endpoints over a shared catalog store.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use playdex_core::{
    AppSearch, Application, CategoryGroups, CategoryRating, DateField, DimensionKind, PriceFilter,
};
use playdex_etl::Settings;
use playdex_storage::{PgStore, StorageError, Store, Upsert};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "playdex-web";

const MAX_SEARCH_LIMIT: i64 = 5_000;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub groups: CategoryGroups,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, groups: CategoryGroups) -> Self {
        Self { store, groups }
    }

    fn group_members(&self, group: &str) -> Result<Vec<String>, ApiError> {
        self.groups
            .members(group)
            .map(<[String]>::to_vec)
            .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("unknown category group {group:?}")))
    }
}

type Shared = Arc<AppState>;

/// Error response with a `{"detail": ...}` body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { .. } => Self::new(StatusCode::NOT_FOUND, err.to_string()),
            StorageError::Conflict(_) => Self::new(StatusCode::CONFLICT, err.to_string()),
            StorageError::InvalidReference(_) => {
                Self::new(StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
            }
            other => {
                error!(error = %other, "storage failure");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "storage failure")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/categories", post(create_category))
        .route(
            "/categories/{id}",
            get(get_category).put(update_category).delete(delete_category),
        )
        .route("/developers", post(create_developer))
        .route(
            "/developers/{id}",
            get(get_developer).put(update_developer).delete(delete_developer),
        )
        .route("/apps", post(create_app))
        .route(
            "/apps/{app_id}",
            get(get_app).put(update_app).delete(delete_app),
        )
        .route("/reports/groups", get(groups_handler))
        .route("/reports/search", get(search_handler))
        .route("/reports/free", get(free_handler))
        .route("/reports/yearly", get(yearly_handler))
        .route("/reports/average-rating", get(average_rating_handler))
        .route("/reports/average-rating/chart", get(average_rating_chart_handler))
        .route("/reports/rating-distribution", get(rating_distribution_handler))
        .with_state(Arc::new(state))
}

/// Connects to Postgres with `settings.database` and serves until shutdown.
pub async fn serve(settings: &Settings) -> anyhow::Result<()> {
    let store = PgStore::connect(&settings.database)
        .await
        .with_context(|| format!("connecting to {}", settings.database.describe()))?;
    let state = AppState::new(Arc::new(store), settings.category_groups.clone());
    let listener = TcpListener::bind((settings.web_host.as_str(), settings.web_port))
        .await
        .with_context(|| format!("binding {}:{}", settings.web_host, settings.web_port))?;
    info!(addr = %listener.local_addr()?, "serving record API");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct NameBody {
    name: String,
}

fn upsert_response<T: Serialize>(upsert: Upsert<T>) -> Response {
    let status = if upsert.created() {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    (status, Json(upsert.into_inner())).into_response()
}

fn deleted(what: &str) -> Json<serde_json::Value> {
    Json(json!({ "detail": format!("{what} deleted") }))
}

fn dimension_name(kind: DimensionKind, body: &NameBody) -> Result<&str, ApiError> {
    let name = body.name.trim();
    if name.is_empty() {
        return Err(ApiError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("{} name must not be empty", kind.label()),
        ));
    }
    Ok(name)
}

async fn create_dimension(state: &AppState, kind: DimensionKind, body: NameBody) -> Result<Response, ApiError> {
    let name = dimension_name(kind, &body)?;
    let upsert = state.store.create_dimension(kind, name).await?;
    Ok(upsert_response(upsert))
}

async fn update_dimension(
    state: &AppState,
    kind: DimensionKind,
    id: i32,
    body: NameBody,
) -> Result<Response, ApiError> {
    let name = dimension_name(kind, &body)?;
    let row = state.store.update_dimension(kind, id, name).await?;
    Ok(Json(row).into_response())
}

async fn create_category(State(state): State<Shared>, Json(body): Json<NameBody>) -> Result<Response, ApiError> {
    create_dimension(&state, DimensionKind::Category, body).await
}

async fn get_category(State(state): State<Shared>, Path(id): Path<i32>) -> Result<Response, ApiError> {
    let row = state.store.get_dimension(DimensionKind::Category, id).await?;
    Ok(Json(row).into_response())
}

async fn update_category(
    State(state): State<Shared>,
    Path(id): Path<i32>,
    Json(body): Json<NameBody>,
) -> Result<Response, ApiError> {
    update_dimension(&state, DimensionKind::Category, id, body).await
}

async fn delete_category(State(state): State<Shared>, Path(id): Path<i32>) -> Result<Response, ApiError> {
    state.store.delete_dimension(DimensionKind::Category, id).await?;
    Ok(deleted("Category").into_response())
}

async fn create_developer(State(state): State<Shared>, Json(body): Json<NameBody>) -> Result<Response, ApiError> {
    create_dimension(&state, DimensionKind::Developer, body).await
}

async fn get_developer(State(state): State<Shared>, Path(id): Path<i32>) -> Result<Response, ApiError> {
    let row = state.store.get_dimension(DimensionKind::Developer, id).await?;
    Ok(Json(row).into_response())
}

async fn update_developer(
    State(state): State<Shared>,
    Path(id): Path<i32>,
    Json(body): Json<NameBody>,
) -> Result<Response, ApiError> {
    update_dimension(&state, DimensionKind::Developer, id, body).await
}

async fn delete_developer(State(state): State<Shared>, Path(id): Path<i32>) -> Result<Response, ApiError> {
    state.store.delete_dimension(DimensionKind::Developer, id).await?;
    Ok(deleted("Developer").into_response())
}

async fn create_app(State(state): State<Shared>, Json(body): Json<Application>) -> Result<Response, ApiError> {
    if body.app_id.trim().is_empty() {
        return Err(ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, "app_id must not be empty"));
    }
    let upsert = state.store.create_application(&body).await?;
    Ok(upsert_response(upsert))
}

async fn get_app(State(state): State<Shared>, Path(app_id): Path<String>) -> Result<Response, ApiError> {
    let row = state.store.get_application(&app_id).await?;
    Ok(Json(row).into_response())
}

async fn update_app(
    State(state): State<Shared>,
    Path(app_id): Path<String>,
    Json(body): Json<Application>,
) -> Result<Response, ApiError> {
    let row = state.store.update_application(&app_id, &body).await?;
    Ok(Json(row).into_response())
}

async fn delete_app(State(state): State<Shared>, Path(app_id): Path<String>) -> Result<Response, ApiError> {
    state.store.delete_application(&app_id).await?;
    Ok(deleted("App").into_response())
}

#[derive(Debug, Serialize)]
struct ReportBody<T> {
    elapsed_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    group: Option<String>,
    rows: T,
}

fn report<T: Serialize>(started: Instant, group: Option<&str>, rows: T) -> Response {
    Json(ReportBody {
        elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
        group: group.map(str::to_string),
        rows,
    })
    .into_response()
}

// "All" in a filter means no filter.
fn selected(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty() && !v.eq_ignore_ascii_case("all"))
}

async fn groups_handler(State(state): State<Shared>) -> Json<CategoryGroups> {
    Json(state.groups.clone())
}

#[derive(Debug, Default, Deserialize)]
struct SearchQuery {
    group: Option<String>,
    rating_min: Option<f64>,
    rating_max: Option<f64>,
    #[serde(default)]
    price: PriceFilter,
    content_rating: Option<String>,
    limit: Option<i64>,
}

async fn search_handler(State(state): State<Shared>, Query(query): Query<SearchQuery>) -> Result<Response, ApiError> {
    let started = Instant::now();
    let defaults = AppSearch::default();
    let group = selected(query.group);
    let categories = match &group {
        Some(group) => state.group_members(group)?,
        None => Vec::new(),
    };
    let filter = AppSearch {
        rating_min: query.rating_min.unwrap_or(defaults.rating_min),
        rating_max: query.rating_max.unwrap_or(defaults.rating_max),
        categories,
        price: query.price,
        content_rating: selected(query.content_rating),
        limit: query.limit.unwrap_or(defaults.limit),
    };
    if filter.rating_min > filter.rating_max {
        return Err(ApiError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "rating_min must not exceed rating_max",
        ));
    }
    if !(1..=MAX_SEARCH_LIMIT).contains(&filter.limit) {
        return Err(ApiError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("limit must be between 1 and {MAX_SEARCH_LIMIT}"),
        ));
    }
    let rows = state.store.search_applications(&filter).await?;
    Ok(report(started, group.as_deref(), rows))
}

#[derive(Debug, Deserialize)]
struct GroupQuery {
    group: String,
}

async fn free_handler(State(state): State<Shared>, Query(query): Query<GroupQuery>) -> Result<Response, ApiError> {
    let started = Instant::now();
    let members = state.group_members(&query.group)?;
    let names = state.store.free_applications(&members).await?;
    Ok(report(started, Some(&query.group), names))
}

#[derive(Debug, Deserialize)]
struct YearlyQuery {
    group: String,
    #[serde(default)]
    field: DateField,
}

async fn yearly_handler(State(state): State<Shared>, Query(query): Query<YearlyQuery>) -> Result<Response, ApiError> {
    let started = Instant::now();
    let members = state.group_members(&query.group)?;
    let counts = state.store.yearly_counts(&members, query.field).await?;
    Ok(report(started, Some(&query.group), counts))
}

async fn average_rating_handler(State(state): State<Shared>) -> Result<Response, ApiError> {
    let started = Instant::now();
    let rows = state.store.average_rating_by_category().await?;
    Ok(report(started, None, rows))
}

async fn average_rating_chart_handler(State(state): State<Shared>) -> Result<Response, ApiError> {
    let started = Instant::now();
    let rows = state.store.average_rating_by_category().await?;
    Ok(Json(json!({
        "elapsed_ms": started.elapsed().as_secs_f64() * 1000.0,
        "figure": average_rating_figure(&rows),
    }))
    .into_response())
}

/// Plotly bar figure of average rating per category. Unrated categories are left out.
pub fn average_rating_figure(rows: &[CategoryRating]) -> serde_json::Value {
    let rated = rows
        .iter()
        .filter_map(|r| r.avg_rating.map(|avg| (r.category.as_str(), avg)))
        .collect::<Vec<_>>();
    let x = rated.iter().map(|(c, _)| *c).collect::<Vec<_>>();
    let y = rated.iter().map(|(_, avg)| *avg).collect::<Vec<_>>();
    json!({
        "data": [{
            "type": "bar",
            "x": x,
            "y": y,
            "marker": {"color": "#0ea5e9"}
        }],
        "layout": {
            "title": "Average Rating per Category",
            "xaxis": {"title": "Category"},
            "yaxis": {"title": "Average rating", "range": [0, 5]},
            "paper_bgcolor": "#ffffff",
            "plot_bgcolor": "#f8fafc"
        }
    })
}

async fn rating_distribution_handler(State(state): State<Shared>) -> Result<Response, ApiError> {
    let started = Instant::now();
    let rows = state.store.rating_distribution().await?;
    Ok(report(started, None, rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use playdex_core::ApplicationAttributes;
    use playdex_storage::{CatalogStore, MemoryStore};
    use serde_json::Value;
    use tower::ServiceExt;

    fn router(store: Arc<MemoryStore>) -> Router {
        app(AppState::new(store, CategoryGroups::default()))
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn application(app_id: &str, category_id: i32, rating: f64, price: f64) -> Application {
        Application {
            app_id: app_id.to_string(),
            name: Some(format!("{app_id} name")),
            category_id,
            developer_id: 1,
            attributes: ApplicationAttributes {
                rating: Some(rating),
                price: Some(price),
                free: price == 0.0,
                released: chrono_date(2020),
                ..Default::default()
            },
        }
    }

    fn chrono_date(year: i32) -> Option<chrono::NaiveDate> {
        chrono::NaiveDate::from_ymd_opt(year, 1, 15)
    }

    async fn seeded() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_dimension_names(
                DimensionKind::Category,
                &["Puzzle".into(), "Tools".into(), "Dating".into()],
            )
            .await
            .unwrap();
        store
            .insert_dimension_names(DimensionKind::Developer, &["Acme Inc".into()])
            .await
            .unwrap();
        store
            .insert_applications(&[
                application("com.puzzle.free", 1, 4.2, 0.0),
                application("com.tools.paid", 2, 3.1, 2.99),
                application("com.tools.free", 2, 4.8, 0.0),
                application("com.dating.free", 3, 2.5, 0.0),
            ])
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        let app = router(Arc::new(MemoryStore::new()));
        let (status, body) = send(&app, "GET", "/healthz", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn category_create_is_insert_if_absent() {
        let app = router(Arc::new(MemoryStore::new()));
        let (status, created) = send(&app, "POST", "/categories", Some(json!({"name": "Tools"}))).await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, again) = send(&app, "POST", "/categories", Some(json!({"name": "Tools"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(again["id"], created["id"]);

        let (status, empty) = send(&app, "POST", "/categories", Some(json!({"name": "  "}))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(empty["detail"].as_str().unwrap().contains("must not be empty"));
    }

    #[tokio::test]
    async fn never_created_rows_are_not_found() {
        let app = router(Arc::new(MemoryStore::new()));
        let (status, body) = send(&app, "GET", "/categories/41", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["detail"].as_str().unwrap().contains("41"));

        let (status, _) = send(&app, "GET", "/developers/7", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, "DELETE", "/apps/com.absent", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, "PUT", "/developers/7", Some(json!({"name": "X"}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn developer_rename_conflict_and_referenced_delete() {
        let store = seeded().await;
        let app = router(store.clone());
        let (status, _) = send(&app, "POST", "/developers", Some(json!({"name": "Other Ltd"}))).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, _) = send(&app, "PUT", "/developers/2", Some(json!({"name": "Acme Inc"}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        let (status, renamed) = send(&app, "PUT", "/developers/2", Some(json!({"name": "Other Inc"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(renamed["name"], "Other Inc");

        let (status, _) = send(&app, "DELETE", "/developers/1", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        let (status, body) = send(&app, "DELETE", "/developers/2", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["detail"], "Developer deleted");
    }

    #[tokio::test]
    async fn app_crud_round_trip() {
        let store = seeded().await;
        let app = router(store.clone());
        let body = json!({
            "app_id": "com.new.app",
            "name": "New App",
            "category_id": 2,
            "developer_id": 1,
            "rating": 4.0,
            "price": 0.0,
            "free": true,
            "released": "2021-03-04"
        });
        let (status, created) = send(&app, "POST", "/apps", Some(body.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["released"], "2021-03-04");
        assert_eq!(created["installs"], Value::Null);

        let (status, _) = send(&app, "POST", "/apps", Some(body)).await;
        assert_eq!(status, StatusCode::OK);

        let update = json!({
            "app_id": "ignored.key",
            "name": "Renamed",
            "category_id": 1,
            "developer_id": 1
        });
        let (status, updated) = send(&app, "PUT", "/apps/com.new.app", Some(update)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["app_id"], "com.new.app");
        assert_eq!(updated["name"], "Renamed");
        assert_eq!(updated["free"], false);

        let (status, fetched) = send(&app, "GET", "/apps/com.new.app", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["category_id"], 1);

        let (status, _) = send(&app, "DELETE", "/apps/com.new.app", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&app, "GET", "/apps/com.new.app", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn app_with_unknown_reference_is_unprocessable() {
        let app = router(seeded().await);
        let (status, body) = send(
            &app,
            "POST",
            "/apps",
            Some(json!({"app_id": "com.bad", "category_id": 99, "developer_id": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["detail"].as_str().unwrap().contains("com.bad"));
    }

    #[tokio::test]
    async fn search_filters_by_group_price_and_rating() {
        let app = router(seeded().await);
        let (status, body) = send(&app, "GET", "/reports/search?group=Tools&price=free", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["group"], "Tools");
        assert!(body["elapsed_ms"].as_f64().is_some());
        let rows = body["rows"].as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["app_id"], "com.tools.free");
        assert_eq!(rows[0]["developer_name"], "Acme Inc");

        let (_, body) = send(&app, "GET", "/reports/search?rating_min=4.0&rating_max=5.0", None).await;
        let ids = body["rows"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["app_id"].as_str().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["com.puzzle.free", "com.tools.free"]);

        let (status, _) = send(&app, "GET", "/reports/search?rating_min=4&rating_max=1", None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn group_reports() {
        let app = router(seeded().await);
        let (status, body) = send(&app, "GET", "/reports/free?group=Games", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["rows"], json!(["com.puzzle.free name"]));

        let (status, body) = send(&app, "GET", "/reports/yearly?group=Tools&field=released", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["rows"], json!([{"year": 2020, "app_count": 2}]));

        let (status, body) = send(&app, "GET", "/reports/free?group=Weather", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["detail"].as_str().unwrap().contains("Weather"));

        let (status, body) = send(&app, "GET", "/reports/groups", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn rating_aggregates_and_chart() {
        let app = router(seeded().await);
        let (_, body) = send(&app, "GET", "/reports/average-rating", None).await;
        assert_eq!(body["rows"][0]["category"], "Puzzle");

        let (_, body) = send(&app, "GET", "/reports/rating-distribution", None).await;
        assert_eq!(
            body["rows"],
            json!([
                {"bucket": 2, "app_count": 1},
                {"bucket": 3, "app_count": 1},
                {"bucket": 4, "app_count": 2}
            ])
        );

        let (status, body) = send(&app, "GET", "/reports/average-rating/chart", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["figure"]["data"][0]["type"], "bar");
        assert_eq!(body["figure"]["data"][0]["x"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn figure_skips_unrated_categories() {
        let figure = average_rating_figure(&[
            CategoryRating {
                category: "Tools".into(),
                avg_rating: Some(3.95),
            },
            CategoryRating {
                category: "Empty".into(),
                avg_rating: None,
            },
        ]);
        assert_eq!(figure["data"][0]["x"], json!(["Tools"]));
        assert_eq!(figure["data"][0]["y"], json!([3.95]));
    }
}

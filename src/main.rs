//! Ad console tree service - cached, mutation-synced service trees plus the
//! console's chart, segment and search helpers.

mod cache;
mod config;
mod error;
mod model;
mod search;
mod segment;
mod source;
mod stats;
mod tree;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use cache::{Applied, SharedTree, TreeCache};
use config::{AppConfig, SourceConfig};
use error::TreeError;
use model::{EntityKind, Schema};
use search::{flatten_to_contents, SearchClient, SearchForm};
use segment::{ColumnMeta, Dataset, RuleGroup};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use source::{DirTreeSource, RestTreeSource, TreeSource};
use stats::{ChartData, DatasetRequest};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tree::{Mutation, MutationOutcome, SelectOption};

type ApiError = (StatusCode, String);

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    cache: TreeCache,
    search: SearchClient,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "adconsole_tree=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env()?;

    let source: Arc<dyn TreeSource> = match &config.source {
        SourceConfig::Rest { url, api_key } => {
            info!("Reading service trees from {}", url);
            Arc::new(RestTreeSource::new(url.clone(), api_key.clone()))
        }
        SourceConfig::Dir(dir) => {
            info!("Reading service trees from directory {:?}", dir);
            Arc::new(DirTreeSource::new(dir.clone()))
        }
    };

    let state = AppState {
        cache: TreeCache::new(
            source,
            Arc::new(Schema::service()),
            config.cache_ttl,
            config.cache_max_capacity,
        ),
        search: SearchClient::new(config.search_url.clone()),
    };
    info!(
        "Tree cache ready (ttl {:?}, capacity {})",
        config.cache_ttl, config.cache_max_capacity
    );

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("Server listening on http://{}", config.bind_addr);
    axum::serve(listener, app(state)).await?;

    Ok(())
}

fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/services", delete(drop_all_trees))
        .route("/services/{id}/tree", get(get_tree).delete(drop_tree))
        .route("/services/{id}/records", get(get_records))
        .route("/services/{id}/nodes/{kind}", get(list_nodes))
        .route("/services/{id}/nodes/{kind}/{node_id}", get(get_node))
        .route(
            "/services/{id}/nodes/{kind}/{node_id}/options/{collection}",
            get(get_options),
        )
        .route("/services/{id}/mutations", post(apply_mutation))
        .route("/services/{id}/stats/datasets", post(chart_datasets))
        .route("/services/{id}/search", post(search_ads))
        .route("/stats/default-range", get(default_range))
        .route("/segments/sql", post(segment_sql))
        .route("/segments/values", post(segment_values_sql))
        .route("/datasets/sql", post(dataset_sql))
        .route("/datasets/parse", post(parse_dataset_sql))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> &'static str {
    "ok"
}

/// Denormalized tree with cache bookkeeping.
async fn get_tree(
    State(state): State<AppState>,
    Path(service_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let entry = load(&state, &service_id).await?;
    let cached = entry.read().await;
    let schema = cached.tree.schema();

    let counts: BTreeMap<&str, usize> = EntityKind::ALL
        .into_iter()
        .filter(|kind| schema.contains(*kind))
        .map(|kind| (kind.as_str(), cached.tree.count(kind)))
        .collect();

    Ok(Json(json!({
        "serviceId": service_id,
        "revision": cached.revision,
        "fetchedAt": cached.fetched_at,
        "fingerprint": cached.tree.fingerprint(),
        "counts": counts,
        "tree": cached.tree.root(),
    })))
}

/// The same tree in nested-array (relational include) shape.
async fn get_records(
    State(state): State<AppState>,
    Path(service_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let entry = load(&state, &service_id).await?;
    let cached = entry.read().await;
    Ok(Json(cached.tree.records()))
}

async fn list_nodes(
    State(state): State<AppState>,
    Path((service_id, kind)): Path<(String, String)>,
) -> Result<Json<Vec<Value>>, ApiError> {
    let kind = parse_kind(&kind)?;
    let entry = load(&state, &service_id).await?;
    let cached = entry.read().await;
    Ok(Json(
        cached.tree.nodes(kind).into_iter().map(tree::flatten).collect(),
    ))
}

/// A single subtree and its path from the root.
async fn get_node(
    State(state): State<AppState>,
    Path((service_id, kind, node_id)): Path<(String, String, String)>,
) -> Result<Json<Value>, ApiError> {
    let kind = parse_kind(&kind)?;
    let entry = load(&state, &service_id).await?;
    let cached = entry.read().await;

    let not_found = || tree_error(TreeError::NodeNotFound {
        kind,
        id: node_id.clone(),
    });
    let node = cached.tree.get(kind, &node_id).ok_or_else(not_found)?;
    let path = cached.tree.path_of(kind, &node_id).ok_or_else(not_found)?;

    Ok(Json(json!({ "kind": kind, "path": path, "node": node })))
}

async fn get_options(
    State(state): State<AppState>,
    Path((service_id, kind, node_id, collection)): Path<(String, String, String, String)>,
) -> Result<Json<Vec<SelectOption>>, ApiError> {
    let kind = parse_kind(&kind)?;
    let entry = load(&state, &service_id).await?;
    let cached = entry.read().await;
    let options = cached.tree.children(kind, &node_id, &collection);
    options
        .map(Json)
        .ok_or_else(|| tree_error(TreeError::NodeNotFound { kind, id: node_id }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MutationResponse {
    applied: bool,
    revision: Option<u64>,
    outcome: Option<MutationOutcome>,
}

/// Splice a store write result into the cached tree.
async fn apply_mutation(
    State(state): State<AppState>,
    Path(service_id): Path<String>,
    Json(mutation): Json<Mutation>,
) -> Result<Json<MutationResponse>, ApiError> {
    let applied = state
        .cache
        .apply(&service_id, mutation)
        .await
        .map_err(|e| {
            warn!("Mutation on service {} rejected: {}", service_id, e);
            tree_error(e)
        })?;

    Ok(Json(match applied {
        Applied::Patched { outcome, revision } => {
            info!(
                "Applied {} {} to service {} (revision {})",
                outcome.kind, outcome.id, service_id, revision
            );
            MutationResponse {
                applied: true,
                revision: Some(revision),
                outcome: Some(outcome),
            }
        }
        Applied::NotCached => MutationResponse {
            applied: false,
            revision: None,
            outcome: None,
        },
    }))
}

async fn drop_tree(State(state): State<AppState>, Path(service_id): Path<String>) -> StatusCode {
    if state.cache.contains(&service_id).await {
        info!("Dropping cached service {}", service_id);
    }
    state.cache.invalidate(&service_id).await;
    StatusCode::NO_CONTENT
}

async fn drop_all_trees(State(state): State<AppState>) -> StatusCode {
    state.cache.invalidate_all();
    info!("Dropped all cached service trees");
    StatusCode::NO_CONTENT
}

async fn chart_datasets(
    State(state): State<AppState>,
    Path(service_id): Path<String>,
    Json(request): Json<DatasetRequest>,
) -> Result<Json<ChartData>, ApiError> {
    let entry = load(&state, &service_id).await?;
    let cached = entry.read().await;
    stats::build_datasets(&cached.tree, &request)
        .map(Json)
        .map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))
}

async fn default_range() -> Json<Value> {
    let (start, end) = stats::default_date_range(chrono::Utc::now().date_naive());
    Json(json!({ "startDate": start, "endDate": end }))
}

/// Run a search against the serving API and flatten the hits to contents.
async fn search_ads(
    State(state): State<AppState>,
    Path(service_id): Path<String>,
    Json(form): Json<SearchForm>,
) -> Result<Json<Value>, ApiError> {
    let results = state.search.search(&service_id, &form).await.map_err(|e| {
        error!("Search failed: {:#}", e);
        (StatusCode::BAD_GATEWAY, format!("Search failed: {:#}", e))
    })?;

    let contents: BTreeMap<&String, Vec<Value>> = results
        .iter()
        .map(|(group, placements)| (group, flatten_to_contents(placements)))
        .collect();

    Ok(Json(json!({ "results": results, "contents": contents })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SegmentSqlRequest {
    query: RuleGroup,
    #[serde(default)]
    columns: Vec<ColumnMeta>,
    cube_sql: Option<String>,
    id_field: Option<String>,
    #[serde(default)]
    distinct: bool,
}

#[derive(Debug, Serialize)]
struct SegmentSqlResponse {
    #[serde(rename = "where")]
    where_clause: String,
    population: Option<String>,
}

async fn segment_sql(
    Json(request): Json<SegmentSqlRequest>,
) -> Result<Json<SegmentSqlResponse>, ApiError> {
    let invalid = |e: segment::SegmentError| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string());

    let where_clause = segment::to_sql_where(&request.query, &request.columns).map_err(invalid)?;
    let population = request
        .cube_sql
        .as_deref()
        .map(|sql| {
            segment::population_sql(
                sql,
                Some(&where_clause),
                request.id_field.as_deref(),
                request.distinct,
            )
        })
        .transpose()
        .map_err(invalid)?;

    Ok(Json(SegmentSqlResponse {
        where_clause,
        population,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValuesSqlRequest {
    cube_sql: String,
    column: ColumnMeta,
    search: Option<String>,
}

/// Query listing a column's distinct values, for the rule value picker.
async fn segment_values_sql(
    Json(request): Json<ValuesSqlRequest>,
) -> Result<Json<Value>, ApiError> {
    let sql = segment::distinct_values_sql(&request.cube_sql, &request.column, request.search.as_deref())
        .map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;
    Ok(Json(json!({ "sql": sql })))
}

async fn dataset_sql(Json(dataset): Json<Dataset>) -> Result<Json<Value>, ApiError> {
    let sql = segment::build_join_sql(&dataset)
        .map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;
    Ok(Json(json!({ "sql": sql })))
}

#[derive(Debug, Deserialize)]
struct ParseDatasetRequest {
    sql: String,
}

async fn parse_dataset_sql(
    Json(request): Json<ParseDatasetRequest>,
) -> Result<Json<Dataset>, ApiError> {
    segment::parse_join_sql(&request.sql).map(Json).ok_or((
        StatusCode::UNPROCESSABLE_ENTITY,
        "No read_parquet tables found".to_string(),
    ))
}

// ============================================================================
// Helper functions
// ============================================================================

async fn load(state: &AppState, service_id: &str) -> Result<SharedTree, ApiError> {
    state.cache.get_or_fetch(service_id).await.map_err(|e| {
        error!("{:#}", e);
        (StatusCode::BAD_GATEWAY, format!("{:#}", e))
    })
}

fn parse_kind(kind: &str) -> Result<EntityKind, ApiError> {
    EntityKind::parse(kind).ok_or_else(|| {
        (StatusCode::BAD_REQUEST, format!("Unknown entity kind: {}", kind))
    })
}

fn tree_error(err: TreeError) -> ApiError {
    let status = match err {
        TreeError::AncestorNotFound { .. } | TreeError::NodeNotFound { .. } => StatusCode::NOT_FOUND,
        TreeError::NameConflict { .. } => StatusCode::CONFLICT,
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    };
    (status, err.to_string())
}

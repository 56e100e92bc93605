use axum::{
    Json,
    body::Bytes,
    extract::{Extension, Path, Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

use super::protocol::{
    Action, HEADER_CURRENT_HASH, HEADER_KEY, HEADER_LAST_HASH, ListResponse, MSG_INVALID_BUILDER_TYPE,
    MSG_MALFORMED_JSON, MSG_MALFORMED_REQUEST, MSG_MISSING_HASH, MSG_UNCHANGED, Mutation,
    RebalanceResponse, SearchRequest, SearchResponse, WriteResponse,
};
use super::service::{Applied, CatalogService, FileKind};
use crate::catalog::types::Category;
use crate::error::{Error, ErrorResponse, Result};
use crate::store::version::VersionToken;

/// Shared key every request must present in `X-Ring-Builder-Key`.
#[derive(Clone)]
pub struct AuthKey(pub Arc<str>);

pub async fn require_key(State(key): State<AuthKey>, req: Request, next: Next) -> Response {
    let presented = req
        .headers()
        .get(HEADER_KEY)
        .and_then(|v| v.to_str().ok());

    if presented != Some(&*key.0) {
        tracing::warn!(
            "Rejected {} {}: missing or wrong key",
            req.method(),
            req.uri().path()
        );
        return Error::Unauthorized.into_response();
    }
    next.run(req).await
}

/// One line per request: method, path, status, elapsed.
pub async fn access_log(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(req).await;

    tracing::info!(
        "{} {} -> {} ({:?})",
        method,
        path,
        response.status().as_u16(),
        started.elapsed()
    );
    response
}

fn hash_header(token: &VersionToken) -> [(&'static str, String); 1] {
    [(HEADER_CURRENT_HASH, token.0.clone())]
}

/// `<category><suffix>` → category. Unknown names are missing files, not bad requests.
fn category_of_file(file: &str, suffix: &str) -> Result<Category> {
    file.strip_suffix(suffix)
        .and_then(|name| name.parse().ok())
        .ok_or_else(|| Error::NotFound(format!("{} not found", file)))
}

fn category_of_path(category: &str) -> Result<Category> {
    category
        .parse()
        .map_err(|_| Error::bad_request(MSG_INVALID_BUILDER_TYPE))
}

async fn fetch(service: &CatalogService, category: Category, kind: FileKind) -> Result<Response> {
    let (bytes, token) = service.fetch(category, kind).await?;
    let content_type = match kind {
        FileKind::Builder => "application/json",
        FileKind::Ring => "application/octet-stream",
    };
    Ok((
        StatusCode::OK,
        hash_header(&token),
        [(header::CONTENT_TYPE, content_type)],
        bytes,
    )
        .into_response())
}

async fn head(service: &CatalogService, category: Category, kind: FileKind) -> Result<Response> {
    let token = service.current_token(category, kind).await?;
    Ok((StatusCode::OK, hash_header(&token)).into_response())
}

pub async fn handle_fetch_builder(
    Extension(service): Extension<Arc<CatalogService>>,
    Path(file): Path<String>,
) -> Result<Response> {
    let category = category_of_file(&file, ".builder")?;
    fetch(&service, category, FileKind::Builder).await
}

pub async fn handle_head_builder(
    Extension(service): Extension<Arc<CatalogService>>,
    Path(file): Path<String>,
) -> Result<Response> {
    let category = category_of_file(&file, ".builder")?;
    head(&service, category, FileKind::Builder).await
}

pub async fn handle_fetch_ring(
    Extension(service): Extension<Arc<CatalogService>>,
    Path(file): Path<String>,
) -> Result<Response> {
    let category = category_of_file(&file, ".ring.gz")?;
    fetch(&service, category, FileKind::Ring).await
}

pub async fn handle_head_ring(
    Extension(service): Extension<Arc<CatalogService>>,
    Path(file): Path<String>,
) -> Result<Response> {
    let category = category_of_file(&file, ".ring.gz")?;
    head(&service, category, FileKind::Ring).await
}

/// `GET /ringbuilder/<category>/list`. `list` is the only GET action; like the file paths,
/// an unknown category is a 404.
pub async fn handle_list(
    Extension(service): Extension<Arc<CatalogService>>,
    Path((category, action)): Path<(String, String)>,
) -> Result<Response> {
    let category: Category = category
        .parse()
        .map_err(|_| Error::NotFound(format!("Unknown builder type: {}", category)))?;
    if action != "list" {
        return Err(Error::NotFound(format!("Unknown action: {}", action)));
    }

    let (devices, token) = service.list(category).await?;
    Ok((
        StatusCode::OK,
        hash_header(&token),
        Json(ListResponse {
            hash: token,
            devices,
        }),
    )
        .into_response())
}

/// `POST /ringbuilder/<category>/<action>`.
pub async fn handle_action(
    Extension(service): Extension<Arc<CatalogService>>,
    Path((category, action)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let category = category_of_path(&category)?;
    let action: Action = action.parse()?;

    let body: Value = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Object(Default::default())
    } else {
        serde_json::from_slice(&body).map_err(|_| Error::bad_request(MSG_MALFORMED_JSON))?
    };

    if action == Action::Search {
        let req: SearchRequest =
            serde_json::from_value(body).map_err(|_| Error::bad_request(MSG_MALFORMED_REQUEST))?;
        let (devices, token) = service.search(category, &req.value).await?;
        return Ok((
            StatusCode::OK,
            hash_header(&token),
            Json(SearchResponse {
                hash: token,
                devices,
            }),
        )
            .into_response());
    }

    let expected = headers
        .get(HEADER_LAST_HASH)
        .and_then(|v| v.to_str().ok())
        .map(|v| VersionToken(v.trim().to_string()))
        .ok_or_else(|| Error::bad_request(MSG_MISSING_HASH))?;
    let mutation = Mutation::parse(action, &body)?;

    let applied = service.apply(category, &expected, mutation).await?;
    let response = match applied {
        Applied::Written(token) => (
            StatusCode::OK,
            hash_header(&token),
            Json(WriteResponse { hash: token }),
        )
            .into_response(),
        Applied::Unchanged(token) => (
            StatusCode::BAD_REQUEST,
            hash_header(&token),
            Json(ErrorResponse {
                error: MSG_UNCHANGED.to_string(),
                code: "unchanged".to_string(),
            }),
        )
            .into_response(),
        Applied::Rebalanced {
            token,
            report,
            partitions,
            ..
        } => (
            StatusCode::OK,
            hash_header(&token),
            Json(RebalanceResponse {
                hash: token,
                reassigned: report.reassigned,
                balance: report.balance,
                partitions,
            }),
        )
            .into_response(),
    };
    Ok(response)
}

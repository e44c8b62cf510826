//! Axum router and all RPC handlers.
//!
//! `build_router` is the single entry point; `serve` attaches middleware
//! layers afterwards so tests can compose the bare router.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use mpf_db::{
    account_state, create_session, delete_session, first_account_for_user, search_statuses,
    session_uid, set_user_state, stream_state, update_status, user_state,
};
use mpf_schemas::{Error, ListDirection, SetStatusAction, UserInfo};
use tracing::info;

use crate::api_types::*;
use crate::state::AppState;

pub const SESSION_COOKIE: &str = "mastopoof_session";
const SESSION_TTL_SECS: i64 = 30 * 24 * 3600;

// ---------------------------------------------------------------------------
// Error envelope
// ---------------------------------------------------------------------------

pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self.0 {
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Error::InvalidArgument(_) => (StatusCode::BAD_REQUEST, "invalid_argument"),
            Error::PermissionDenied(_) => (StatusCode::FORBIDDEN, "permission_denied"),
            Error::Upstream { .. } => (StatusCode::BAD_GATEWAY, "upstream"),
            Error::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            // CleanAbort is transaction-internal; reaching here is a bug.
            Error::Internal(_) | Error::CleanAbort => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "internal error");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                kind: kind.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
/// Middleware layers (CORS, tracing) are attached by `serve`, not here.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/bootstrap", get(bootstrap))
        .route("/v1/login", post(login))
        .route("/v1/logout", post(logout))
        .route("/v1/authorize", post(authorize))
        .route("/v1/token", post(token))
        .route("/v1/list", post(list))
        .route("/v1/fetch", post(fetch))
        .route("/v1/set-read", post(set_read))
        .route("/v1/set-status", post(set_status))
        .route("/v1/search", post(search))
        .route("/v1/settings", post(update_settings))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Session helpers
// ---------------------------------------------------------------------------

/// Resolve the session cookie to a uid, or reject as unauthenticated.
async fn require_uid(st: &AppState, jar: &CookieJar) -> ApiResult<i64> {
    let Some(cookie) = jar.get(SESSION_COOKIE) else {
        return Err(Error::PermissionDenied("not logged in".to_string()).into());
    };
    let token = cookie.value().to_string();

    // Lookup purges expired rows, so it runs on the writer.
    let mut txn = st.store.begin().await?;
    let uid = session_uid(txn.conn(), &token).await?;
    txn.commit().await?;

    uid.ok_or_else(|| Error::PermissionDenied("session expired".to_string()).into())
}

/// Load a stream and check it belongs to the calling user.
async fn stream_for_user(
    conn: &mut sqlx::SqliteConnection,
    uid: i64,
    stid: i64,
) -> ApiResult<mpf_schemas::StreamState> {
    let stream = stream_state(conn, stid).await?;
    if stream.uid != uid {
        // Someone else's stream is indistinguishable from a missing one.
        return Err(Error::NotFound(format!("stream {stid}")).into());
    }
    Ok(stream)
}

fn session_cookie(token: String) -> Cookie<'static> {
    let mut cookie = Cookie::new(SESSION_COOKIE, token);
    cookie.set_path("/");
    cookie.set_http_only(true);
    cookie
}

// ---------------------------------------------------------------------------
// Plumbing endpoints
// ---------------------------------------------------------------------------

async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        ok: true,
        service: st.build.service.to_string(),
        version: st.build.version.to_string(),
    })
}

async fn bootstrap(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    Json(BootstrapResponse {
        default_server: st.default_server.clone(),
    })
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

async fn login(State(st): State<Arc<AppState>>, jar: CookieJar) -> ApiResult<Json<LoginResponse>> {
    let uid = require_uid(&st, &jar).await?;
    let mut conn = st.store.read().await?;
    let user = user_state(conn.as_mut(), uid).await?;
    Ok(Json(LoginResponse {
        user_info: UserInfo::for_user(user),
    }))
}

async fn logout(
    State(st): State<Arc<AppState>>,
    jar: CookieJar,
) -> ApiResult<(CookieJar, Json<EmptyResponse>)> {
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        let token = cookie.value().to_string();
        let mut txn = st.store.begin().await?;
        delete_session(txn.conn(), &token).await?;
        txn.commit().await?;
    }
    let mut removal = Cookie::from(SESSION_COOKIE);
    removal.set_path("/");
    Ok((jar.remove(removal), Json(EmptyResponse {})))
}

async fn authorize(
    State(st): State<Arc<AppState>>,
    Json(req): Json<AuthorizeRequest>,
) -> ApiResult<Json<AuthorizeResponse>> {
    let outcome = mpf_auth::authorize(
        &st.store,
        st.client.as_ref(),
        &req.server_addr,
        req.invite_code.as_deref(),
        st.invite_code.as_deref(),
    )
    .await?;
    Ok(Json(AuthorizeResponse {
        authorize_addr: outcome.authorize_addr,
        out_of_band: outcome.out_of_band,
    }))
}

async fn token(
    State(st): State<Arc<AppState>>,
    jar: CookieJar,
    Json(req): Json<TokenRequest>,
) -> ApiResult<(CookieJar, Json<TokenResponse>)> {
    let user_info =
        mpf_auth::token(&st.store, st.client.as_ref(), &req.server_addr, &req.auth_code).await?;

    let mut txn = st.store.begin().await?;
    let token = create_session(txn.conn(), user_info.user.uid, SESSION_TTL_SECS).await?;
    txn.commit().await?;

    // Kick the background fetcher so the backlog starts flowing right away.
    st.ensure_fetcher(user_info.default_stid).await;
    info!(uid = user_info.user.uid, "token exchanged, session created");

    Ok((jar.add(session_cookie(token)), Json(TokenResponse { user_info })))
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

async fn list(
    State(st): State<Arc<AppState>>,
    jar: CookieJar,
    Json(req): Json<ListRequest>,
) -> ApiResult<Json<ListResponse>> {
    let uid = require_uid(&st, &jar).await?;
    st.ensure_fetcher(req.stid).await;

    let (items, stream, ref_used) = match req.direction {
        ListDirection::Initial | ListDirection::Forward => {
            // The pool-draining loop must observe one consistent snapshot,
            // so the whole list call runs in a single write transaction.
            let mut txn = st.store.begin().await?;
            let stream = stream_for_user(txn.conn(), uid, req.stid).await?;
            let user = user_state(txn.conn(), uid).await?;
            let is_initial = req.direction == ListDirection::Initial;
            let ref_used = if is_initial { stream.last_read } else { req.position };
            let (items, stream) = mpf_stream::list_forward(
                txn.conn(),
                req.stid,
                req.position,
                is_initial,
                user.settings.list_count(),
            )
            .await?;
            txn.commit().await?;
            (items, stream, ref_used)
        }
        ListDirection::Backward => {
            let mut conn = st.store.read().await?;
            let _ = stream_for_user(conn.as_mut(), uid, req.stid).await?;
            let user = user_state(conn.as_mut(), uid).await?;
            let (items, stream) = mpf_stream::list_backward(
                conn.as_mut(),
                req.stid,
                req.position,
                user.settings.list_count(),
            )
            .await?;
            (items, stream, req.position)
        }
    };

    let backward_position = items.first().map(|i| i.position).unwrap_or(ref_used);
    let forward_position = items.last().map(|i| i.position).unwrap_or(ref_used);
    let forward_state = if stream.remaining == 0 && forward_position >= stream.last_position {
        ListState::Done
    } else {
        ListState::Partial
    };
    let backward_state =
        if stream.last_position == 0 || backward_position <= stream.first_position {
            ListState::Done
        } else {
            ListState::Partial
        };

    let mut conn = st.store.read().await?;
    let mut accounts: HashMap<i64, AccountSummary> = HashMap::new();
    for item in &items {
        if !accounts.contains_key(&item.asid) {
            let a = account_state(conn.as_mut(), item.asid).await?;
            accounts.insert(
                item.asid,
                AccountSummary {
                    asid: a.asid,
                    server_addr: a.server_addr,
                    username: a.username,
                },
            );
        }
    }

    let items = items
        .into_iter()
        .map(|i| {
            let account = accounts
                .get(&i.asid)
                .cloned()
                .unwrap_or_else(|| AccountSummary {
                    asid: i.asid,
                    server_addr: String::new(),
                    username: String::new(),
                });
            ListItem {
                position: i.position,
                sid: i.sid,
                status: i.status,
                account,
                meta: i.meta,
                state: i.state,
            }
        })
        .collect();

    let fetching = st.is_fetching(req.stid).await;
    Ok(Json(ListResponse {
        items,
        stream_info: StreamInfo { stream, fetching },
        forward_position,
        backward_position,
        forward_state,
        backward_state,
    }))
}

// ---------------------------------------------------------------------------
// Fetch
// ---------------------------------------------------------------------------

async fn fetch(
    State(st): State<Arc<AppState>>,
    jar: CookieJar,
    Json(req): Json<FetchRequest>,
) -> ApiResult<Json<FetchResponse>> {
    let uid = require_uid(&st, &jar).await?;
    {
        let mut conn = st.store.read().await?;
        let _ = stream_for_user(conn.as_mut(), uid, req.stid).await?;
    }
    st.ensure_fetcher(req.stid).await;

    let stats = mpf_ingest::ingest_home(
        &st.store,
        st.client.as_ref(),
        req.stid,
        mpf_ingest::DEFAULT_MAX_BATCHES,
    )
    .await?;

    let mut conn = st.store.read().await?;
    let stream = stream_state(conn.as_mut(), req.stid).await?;
    let fetching = st.is_fetching(req.stid).await;
    Ok(Json(FetchResponse {
        fetched_count: stats.fetched,
        outcome: if stats.hit_batch_cap {
            mpf_schemas::FetchOutcome::More
        } else {
            mpf_schemas::FetchOutcome::Done
        },
        stream_info: StreamInfo { stream, fetching },
    }))
}

// ---------------------------------------------------------------------------
// Read cursor
// ---------------------------------------------------------------------------

async fn set_read(
    State(st): State<Arc<AppState>>,
    jar: CookieJar,
    Json(req): Json<SetReadRequest>,
) -> ApiResult<Json<SetReadResponse>> {
    let uid = require_uid(&st, &jar).await?;

    let mut txn = st.store.begin().await?;
    let _ = stream_for_user(txn.conn(), uid, req.stid).await?;
    let stream = mpf_stream::set_read(txn.conn(), req.stid, req.last_read, req.mode).await?;
    txn.commit().await?;

    let fetching = st.is_fetching(req.stid).await;
    Ok(Json(SetReadResponse {
        stream_info: StreamInfo { stream, fetching },
    }))
}

// ---------------------------------------------------------------------------
// Status actions
// ---------------------------------------------------------------------------

async fn set_status(
    State(st): State<Arc<AppState>>,
    jar: CookieJar,
    Json(req): Json<SetStatusRequest>,
) -> ApiResult<Json<SetStatusResponse>> {
    let uid = require_uid(&st, &jar).await?;
    if req.status_id.is_empty() {
        return Err(Error::InvalidArgument("empty status id".to_string()).into());
    }

    let (rows, account) = {
        let mut conn = st.store.read().await?;
        let rows = search_statuses(conn.as_mut(), uid, &req.status_id).await?;
        let account = first_account_for_user(conn.as_mut(), uid).await?;
        (rows, account)
    };
    if rows.is_empty() {
        return Err(Error::NotFound(format!("status {}", req.status_id)).into());
    }

    let updated = match req.action {
        SetStatusAction::Favourite => {
            st.client
                .favourite(&account.server_addr, &account.access_token, &req.status_id)
                .await?
        }
        SetStatusAction::Unfavourite => {
            st.client
                .unfavourite(&account.server_addr, &account.access_token, &req.status_id)
                .await?
        }
        SetStatusAction::Refresh => {
            st.client
                .status(&account.server_addr, &account.access_token, &req.status_id)
                .await?
        }
    };

    let mut txn = st.store.begin().await?;
    for row in rows.iter().filter(|r| r.status.id == req.status_id) {
        update_status(txn.conn(), row.sid, &updated).await?;
    }
    txn.commit().await?;

    Ok(Json(SetStatusResponse { status: updated }))
}

async fn search(
    State(st): State<Arc<AppState>>,
    jar: CookieJar,
    Json(req): Json<SearchRequest>,
) -> ApiResult<Json<SearchResponse>> {
    let uid = require_uid(&st, &jar).await?;
    if req.status_id.is_empty() {
        return Err(Error::InvalidArgument("empty status id".to_string()).into());
    }

    let mut conn = st.store.read().await?;
    let rows = search_statuses(conn.as_mut(), uid, &req.status_id).await?;
    Ok(Json(SearchResponse {
        items: rows
            .into_iter()
            .map(|r| SearchItem {
                sid: r.sid,
                status: r.status,
                meta: r.meta,
            })
            .collect(),
    }))
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

async fn update_settings(
    State(st): State<Arc<AppState>>,
    jar: CookieJar,
    Json(req): Json<UpdateSettingsRequest>,
) -> ApiResult<Json<EmptyResponse>> {
    let uid = require_uid(&st, &jar).await?;

    let mut txn = st.store.begin().await?;
    let mut user = user_state(txn.conn(), uid).await?;
    user.settings = req.settings;
    set_user_state(txn.conn(), &user).await?;
    txn.commit().await?;

    Ok(Json(EmptyResponse {}))
}

//! Endpoint dispatch table, authorization middleware, and the handlers this
//! crate owns outright. Endpoints delegated to external
//! collaborators are wired as post-auth `501` placeholders so the dispatch
//! table and policy wiring are exercised end-to-end even without their
//! business logic.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Extension, Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tower::Service;

use crate::config::Config;
use crate::error::ApiError;
use crate::identity::store::IdentityStore;
use crate::identity::{AccessLevel, Identity, IdentityJson};
use crate::notices::{ListFilter, NoticePost, NoticeStore};
use crate::policy::{Decision, Policy, decide};
use crate::source::Source;

/// Process-wide state, threaded explicitly through every handler via axum's
/// `State` extractor rather than a hidden singleton.
pub struct Daemon {
    pub identities: IdentityStore,
    pub notices: NoticeStore,
    pub config: Config,
    /// This process's own uid. The notice visibility filter's "admin" sense
    /// is root uid or this uid — distinct from an identity's `AccessLevel`.
    process_uid: u32,
}

impl Daemon {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let identities = IdentityStore::load(Some(config.identities_path.clone()))
            .map_err(|e| anyhow::anyhow!("failed to load identity store: {e}"))?;
        Ok(Self {
            identities,
            notices: NoticeStore::new(),
            config,
            process_uid: unsafe { libc::getuid() },
        })
    }

    /// Whether `uid` is "admin" in the notice-visibility sense: root, or
    /// this daemon process's own uid.
    fn is_notice_admin(&self, uid: u32) -> bool {
        uid == 0 || uid == self.process_uid
    }
}

/// Per-connection facts the authorize middleware needs: what transport the
/// request arrived over and what credential material it carries.
#[derive(Clone)]
pub struct ConnectionContext {
    remote_addr: Option<String>,
    is_tls: bool,
    client_cert_der: Option<Vec<u8>>,
    /// Cancelled the moment this connection's peer disconnects; long-poll
    /// handlers select on it. See [`crate::cancel`].
    cancel: tokio_util::sync::CancellationToken,
}

impl ConnectionContext {
    /// Build a context as if it belonged to a real connection, with a fresh,
    /// uncancelled token. Used directly by callers (tests, embedders) that
    /// drive the router without going through [`serve_connection`] or
    /// [`serve_tls_connection`].
    pub fn synthetic(remote_addr: Option<String>, is_tls: bool, client_cert_der: Option<Vec<u8>>) -> Self {
        Self {
            remote_addr,
            is_tls,
            client_cert_der,
            cancel: tokio_util::sync::CancellationToken::new(),
        }
    }
}

#[derive(Clone, Copy)]
struct EndpointPolicy {
    read: Option<Policy>,
    write: Option<Policy>,
}

/// The resolved identity (if any), attached to the request after a policy
/// allows it. Handlers read this instead of re-deriving credentials.
#[derive(Clone)]
pub struct UserState {
    pub name: String,
    pub access: AccessLevel,
    /// Notice-ownership uid: the identity's Local binding if bound, else the
    /// unix-socket peer uid, else a sentinel that owns nothing. See
    /// `DESIGN.md` for why this fallback chain was chosen.
    pub uid: u32,
}

fn is_idempotent_safe(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD)
}

fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (name, password) = text.split_once(':')?;
    Some((name.to_string(), password.to_string()))
}

/// Credential resolution order: TLS client certificate, then HTTP Basic,
/// then unix-socket uid. The first match wins.
///
/// The second element of the result is whether any credential channel was
/// attempted at all (cert presented, or a Basic header present), regardless
/// of whether it resolved to a known identity — `Policy::IdentityWrite`'s
/// bootstrap path needs that distinction: an unknown Basic-auth user must
/// not look the same as no credentials being presented.
fn resolve_identity(store: &IdentityStore, ctx: &ConnectionContext, headers: &HeaderMap, source: &Source) -> (Option<Identity>, bool) {
    if let Some(der) = &ctx.client_cert_der {
        return (store.get_by_cert(der), true);
    }

    if let Some((name, password)) = basic_credentials(headers) {
        return (store.get_by_basic(&name, &password), true);
    }

    if let Source::UnixSocket(addr) = source {
        return (store.get_by_uid(addr.uid), true);
    }

    (None, false)
}

fn requester_uid(identity: Option<&Identity>, source: &Source) -> u32 {
    if let Some(uid) = identity.and_then(|i| i.local) {
        return uid;
    }
    if let Source::UnixSocket(addr) = source {
        return addr.uid;
    }
    u32::MAX
}

async fn authorize(
    State(daemon): State<Arc<Daemon>>,
    Extension(ctx): Extension<ConnectionContext>,
    Extension(EndpointPolicy { read, write }): Extension<EndpointPolicy>,
    mut request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Result<axum::response::Response, ApiError> {
    let source = Source::classify(ctx.remote_addr.as_deref(), ctx.is_tls);
    let policy = if is_idempotent_safe(request.method()) { read } else { write };
    let Some(policy) = policy else {
        return Err(ApiError::MethodNotAllowed);
    };

    let (identity, credential_attempted) = resolve_identity(&daemon.identities, &ctx, request.headers(), &source);

    match decide(policy, identity.as_ref(), &source, &daemon.identities, credential_attempted) {
        Decision::Allow => {
            if policy == Policy::IdentityEnroll {
                schedule_enrollment_timeout(daemon.clone());
            }

            let uid = requester_uid(identity.as_ref(), &source);
            if let Some(identity) = identity {
                request.extensions_mut().insert(UserState {
                    name: identity.name,
                    access: identity.access,
                    uid,
                });
            }
            Ok(next.run(request).await)
        }
        Decision::Deny => Err(ApiError::Denied),
        Decision::Conflict => Err(ApiError::Conflict),
    }
}

/// Close the enrollment window after `config.enrollment_timeout_secs`,
/// unless something else (a completed enrollment, a write to
/// `/v1/identities`, or shutdown) closes it first — `close_enrollment` is
/// idempotent, so a stale timer firing after an earlier close is harmless.
fn schedule_enrollment_timeout(daemon: Arc<Daemon>) {
    let timeout = std::time::Duration::from_secs(daemon.config.enrollment_timeout_secs);
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if daemon.identities.close_enrollment() {
            log::info!("enrollment window auto-closed after timeout");
        }
    });
}

/// Attach `methods` at `path`, with `authorize` layered *inside* the
/// per-route `EndpointPolicy` extension so the extension is inserted before
/// `authorize` runs (`Router`/`MethodRouter` layers wrap outward: the last
/// `.layer()` call is outermost, i.e. runs first on an incoming request).
/// Layering `authorize` once on the whole `Router` instead would put it
/// outside every route's `AddExtension`, so it would always observe an empty
/// extension and let every request through unchecked.
fn with_policy(
    router: Router<Arc<Daemon>>,
    daemon: Arc<Daemon>,
    path: &str,
    methods: axum::routing::MethodRouter<Arc<Daemon>>,
    read: Option<Policy>,
    write: Option<Policy>,
) -> Router<Arc<Daemon>> {
    router.route(
        path,
        methods
            .layer(axum::middleware::from_fn_with_state(daemon, authorize))
            .layer(Extension(EndpointPolicy { read, write })),
    )
}

pub fn build(daemon: Arc<Daemon>) -> Router {
    let mut router: Router<Arc<Daemon>> = Router::new();

    router = with_policy(router, daemon.clone(), "/v1/system-info", get(system_info), Some(Policy::Open), None);
    router = with_policy(router, daemon.clone(), "/v1/health", get(health), Some(Policy::Open), None);
    router = with_policy(router, daemon.clone(), "/metrics", get(metrics), Some(Policy::Metrics), None);

    router = with_policy(
        router,
        daemon.clone(),
        "/v1/notices",
        get(list_notices).post(post_notice),
        Some(Policy::User),
        Some(Policy::User),
    );
    router = with_policy(router, daemon.clone(), "/v1/notices/{id}", get(get_notice), Some(Policy::User), None);

    router = with_policy(
        router,
        daemon.clone(),
        "/v1/identities",
        get(list_identities).post(write_identities),
        Some(Policy::User),
        Some(Policy::IdentityWrite),
    );
    router = with_policy(
        router,
        daemon.clone(),
        "/v1/identities/enroll",
        post(enroll),
        None,
        Some(Policy::IdentityEnroll),
    );

    // Out-of-scope surface: external collaborators own the business logic,
    // this crate only needs the dispatch table and policy wiring exercised.
    router = with_policy(router, daemon.clone(), "/v1/warnings", get(not_implemented).post(not_implemented), Some(Policy::User), Some(Policy::Admin));
    router = with_policy(router, daemon.clone(), "/v1/changes", get(not_implemented), Some(Policy::User), Some(Policy::Admin));
    router = with_policy(router, daemon.clone(), "/v1/changes/{id}", get(not_implemented), Some(Policy::User), Some(Policy::Admin));
    router = with_policy(router, daemon.clone(), "/v1/changes/{id}/wait", get(not_implemented), Some(Policy::User), Some(Policy::Admin));
    router = with_policy(router, daemon.clone(), "/v1/services", get(not_implemented).post(not_implemented), Some(Policy::User), Some(Policy::Admin));
    router = with_policy(router, daemon.clone(), "/v1/services/{name}", get(not_implemented).post(not_implemented), Some(Policy::User), Some(Policy::Admin));
    router = with_policy(router, daemon.clone(), "/v1/plan", get(not_implemented), Some(Policy::User), None);
    router = with_policy(router, daemon.clone(), "/v1/layers", post(not_implemented), None, Some(Policy::Admin));
    router = with_policy(router, daemon.clone(), "/v1/files", get(not_implemented).post(not_implemented), Some(Policy::Admin), Some(Policy::Admin));
    router = with_policy(router, daemon.clone(), "/v1/logs", get(not_implemented), Some(Policy::User), None);
    router = with_policy(router, daemon.clone(), "/v1/exec", post(not_implemented), None, Some(Policy::Admin));
    router = with_policy(router, daemon.clone(), "/v1/tasks/{id}/websocket/{wsid}", get(not_implemented), Some(Policy::Admin), None);
    router = with_policy(router, daemon.clone(), "/v1/signals", post(not_implemented), None, Some(Policy::Admin));
    router = with_policy(router, daemon.clone(), "/v1/checks", get(not_implemented), Some(Policy::User), None);

    router.with_state(daemon)
}

async fn not_implemented() -> StatusCode {
    StatusCode::NOT_IMPLEMENTED
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "healthy" }))
}

async fn system_info() -> impl IntoResponse {
    Json(serde_json::json!({ "version": env!("CARGO_PKG_VERSION") }))
}

async fn metrics(State(daemon): State<Arc<Daemon>>) -> impl IntoResponse {
    let identities = daemon.identities.list().len();
    let body = format!(
        "# HELP access_core_identities Number of stored identities.\n\
         # TYPE access_core_identities gauge\n\
         access_core_identities {identities}\n"
    );
    ([(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

#[derive(Deserialize)]
struct NoticeListQuery {
    select: Option<String>,
    #[serde(rename = "user-id")]
    user_id: Option<u32>,
    timeout: Option<String>,
}

async fn list_notices(
    State(daemon): State<Arc<Daemon>>,
    Extension(user): Extension<UserState>,
    Extension(ctx): Extension<ConnectionContext>,
    Query(query): Query<NoticeListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if query.select.is_some() && query.user_id.is_some() {
        return Err(ApiError::BadRequest("select and user-id are mutually exclusive".to_string()));
    }

    let is_admin = daemon.is_notice_admin(user.uid);

    let filter = match (&query.select, query.user_id) {
        (Some(s), _) if s == "all" => {
            if !is_admin {
                return Err(ApiError::Forbidden);
            }
            ListFilter::All
        }
        (Some(_), _) => return Err(ApiError::BadRequest("unknown select value".to_string())),
        (None, Some(uid)) => {
            if !is_admin {
                return Err(ApiError::Forbidden);
            }
            ListFilter::User(uid)
        }
        (None, None) => ListFilter::OwnAndPublic,
    };

    if let Some(raw_timeout) = &query.timeout {
        let timeout = crate::notices::parse_wait_timeout(raw_timeout).ok_or(ApiError::BadRequest("bad timeout".to_string()))?;
        let predicate_uid = user.uid;

        let already_visible = !daemon.notices.list(user.uid, is_admin, filter).is_empty();
        if !already_visible {
            let outcome = daemon
                .notices
                .wait_for(timeout, ctx.cancel.cancelled(), move |n| {
                    crate::notices::matches_filter(n, predicate_uid, is_admin, filter)
                })
                .await;

            match outcome {
                crate::notices::WaitOutcome::Ready => {}
                crate::notices::WaitOutcome::DeadlineElapsed => return Ok(Json(Vec::<crate::notices::Notice>::new())),
                crate::notices::WaitOutcome::Cancelled => return Err(ApiError::BadRequest("request cancelled".to_string())),
            }
        }
    }

    let notices = daemon.notices.list(user.uid, is_admin, filter);
    Ok(Json(notices))
}

async fn get_notice(
    State(daemon): State<Arc<Daemon>>,
    Extension(user): Extension<UserState>,
    Path(id): Path<u64>,
) -> Result<impl IntoResponse, ApiError> {
    let is_admin = daemon.is_notice_admin(user.uid);
    daemon.notices.get(id, user.uid, is_admin).map(Json).ok_or(ApiError::NotFound)
}

async fn post_notice(
    State(daemon): State<Arc<Daemon>>,
    Extension(user): Extension<UserState>,
    Json(post): Json<NoticePost>,
) -> Result<impl IntoResponse, ApiError> {
    let notice = daemon
        .notices
        .post(user.uid, post)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(Json(notice))
}

async fn list_identities(State(daemon): State<Arc<Daemon>>) -> impl IntoResponse {
    let identities: HashMap<String, IdentityJson> = daemon
        .identities
        .list()
        .into_iter()
        .map(|i| (i.name.clone(), i.to_json()))
        .collect();
    Json(identities)
}

#[derive(Deserialize)]
struct IdentitiesWrite {
    action: String,
    identities: HashMap<String, Option<IdentityJson>>,
}

async fn write_identities(
    State(daemon): State<Arc<Daemon>>,
    user: Option<Extension<UserState>>,
    Json(body): Json<IdentitiesWrite>,
) -> Result<impl IntoResponse, ApiError> {
    let actor = user.as_ref().map(|Extension(u)| u.name.as_str());

    match body.action.as_str() {
        "add" => {
            let records = body
                .identities
                .into_iter()
                .map(|(name, json)| json.map(|j| (name.clone(), j)).ok_or_else(|| ApiError::BadRequest("add requires a non-null record".to_string())))
                .collect::<Result<Vec<_>, _>>()?;
            daemon.identities.add(actor, records)?;
        }
        "update" => {
            let records = body
                .identities
                .into_iter()
                .map(|(name, json)| json.map(|j| (name.clone(), j)).ok_or_else(|| ApiError::BadRequest("update requires a non-null record".to_string())))
                .collect::<Result<Vec<_>, _>>()?;
            daemon.identities.update(actor, records)?;
        }
        "replace" => {
            let records: Vec<(String, Option<IdentityJson>)> = body.identities.into_iter().collect();
            daemon.identities.replace(actor, records)?;
        }
        "remove" => {
            if body.identities.values().any(Option::is_some) {
                return Err(ApiError::BadRequest("remove requires every value to be null".to_string()));
            }
            let names = body.identities.into_keys().collect();
            daemon.identities.remove(actor, names)?;
        }
        other => return Err(ApiError::BadRequest(format!("unknown action {other:?}"))),
    }

    Ok(StatusCode::OK)
}

async fn enroll(State(daemon): State<Arc<Daemon>>) -> impl IntoResponse {
    let _ = &daemon;
    StatusCode::OK
}

/// Serve a single unix-socket connection, annotating every request on it
/// with the credential-bearing `ConnectionContext` the authorize middleware
/// reads.
pub async fn serve_connection(daemon: Arc<Daemon>, stream: UnixStream, remote_addr: Option<String>, is_tls: bool) -> anyhow::Result<()> {
    use std::os::unix::io::AsRawFd;

    let cancel = tokio_util::sync::CancellationToken::new();
    crate::cancel::watch_for_disconnect(stream.as_raw_fd(), cancel.clone());

    let ctx = ConnectionContext {
        remote_addr,
        is_tls,
        client_cert_der: None,
        cancel,
    };
    serve_io(daemon, stream, ctx).await
}

/// Serve a single already-handshaked TLS connection.
pub async fn serve_tls_connection<IO>(daemon: Arc<Daemon>, stream: tokio_rustls::server::TlsStream<IO>, client_cert_der: Option<Vec<u8>>) -> anyhow::Result<()>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + std::os::unix::io::AsRawFd + 'static,
{
    use std::os::unix::io::AsRawFd;

    let cancel = tokio_util::sync::CancellationToken::new();
    crate::cancel::watch_for_disconnect(stream.get_ref().0.as_raw_fd(), cancel.clone());

    let ctx = ConnectionContext {
        remote_addr: None,
        is_tls: true,
        client_cert_der,
        cancel,
    };
    serve_io(daemon, stream, ctx).await
}

async fn serve_io<IO>(daemon: Arc<Daemon>, io: IO, ctx: ConnectionContext) -> anyhow::Result<()>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let app = build(daemon).layer(Extension(ctx));
    let service = TowerToHyperService::new(
        tower::service_fn(move |req: hyper::Request<Incoming>| {
            let mut app = app.clone();
            async move {
                let (parts, body) = req.into_parts();
                let req = axum::extract::Request::from_parts(parts, Body::new(body));
                let response: Result<axum::response::Response, Infallible> = Service::call(&mut app, req).await.map_err(|e: Infallible| e);
                response
            }
        }),
    );

    hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new())
        .serve_connection(TokioIo::new(io), service)
        .await
        .map_err(|e| anyhow::anyhow!("connection serve error: {e}"))
}

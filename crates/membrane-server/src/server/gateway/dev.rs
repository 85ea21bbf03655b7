//! Local HTTP gateway.
//!
//! Turns plain HTTP calls into triggers so an application can be exercised
//! on a workstation without any cloud infrastructure:
//!
//! | route | trigger |
//! |---|---|
//! | `ANY /apis/{api}/{*path}` | HTTP request for `api` |
//! | `POST /topics/{topic}` | publish the body to `topic` |
//! | `POST /buckets/{bucket}/{created\|deleted}/{*key}` | blob event |
//! | `POST /websockets/{socket}/{connection_id}/{connect\|message\|disconnect}` | websocket event |
//! | `GET /schedules` | registered schedules and cadences |
//! | `POST /schedules/{schedule}` | fire one interval |
//! | `POST /jobs/{job}` | submit the body as job data |
//!
//! Routing misses answer `404`, malformed triggers `400`, failed deliveries
//! `500` and rejected websocket connections `401`.

use super::{Gateway, GatewayHandlers};
use axum::{
    Router,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{any, get, post},
};
use bytes::Bytes;
use core::net::SocketAddr;
use membrane_core::{
    Error,
    proto::{
        apis::{self, HttpRequest},
        batch::{self, JobRequest},
        schedules::{self, IntervalRequest, registration_request::Cadence},
        storage::{self, BlobEvent, BlobEventRequest, BlobEventType},
        topics::{self, Message, MessageRequest},
        websockets::{
            self, WebsocketConnectionEvent, WebsocketDisconnectionEvent, WebsocketEventRequest,
            WebsocketMessageEvent, websocket_event_request::WebsocketEvent,
        },
    },
};
use std::collections::HashMap;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Ingress error rendered as a plain-text response.
#[derive(Debug)]
struct GatewayError {
    status: StatusCode,
    message: String,
}

impl GatewayError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<Error> for GatewayError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::NoWorker { .. } => StatusCode::NOT_FOUND,
            Error::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

type GatewayResult = Result<Response, GatewayError>;

/// Answers `202` when every worker reported success and `500` otherwise.
fn outcome(success: bool) -> GatewayResult {
    if success {
        Ok(StatusCode::ACCEPTED.into_response())
    } else {
        Err(GatewayError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "worker reported failure",
        ))
    }
}

fn unexpected_reply(kind: &str) -> GatewayError {
    GatewayError::new(
        StatusCode::BAD_GATEWAY,
        format!("worker sent an unexpected {kind} reply"),
    )
}

/// Groups repeated query keys, keeping their order.
fn group_query(pairs: Vec<(String, String)>) -> HashMap<String, Vec<String>> {
    let mut grouped: HashMap<String, Vec<String>> = HashMap::new();
    for (key, value) in pairs {
        grouped.entry(key).or_default().push(value);
    }
    grouped
}

fn http_request(
    method: Method,
    path: String,
    headers: &HeaderMap,
    query: Vec<(String, String)>,
    body: Bytes,
) -> HttpRequest {
    let mut grouped_headers: HashMap<String, apis::HeaderValue> = HashMap::new();
    for (name, value) in headers {
        match value.to_str() {
            Ok(value) => grouped_headers
                .entry(name.as_str().to_owned())
                .or_default()
                .value
                .push(value.to_owned()),
            Err(_) => tracing::debug!(header = %name, "skipping non-ascii header value"),
        }
    }

    HttpRequest {
        method: method.as_str().to_owned(),
        path: format!("/{}", path.trim_start_matches('/')),
        headers: grouped_headers,
        query_params: group_query(query)
            .into_iter()
            .map(|(key, value)| (key, apis::QueryValue { value }))
            .collect(),
        body,
        path_params: HashMap::new(),
    }
}

fn http_response(response: apis::HttpResponse) -> Response {
    let status = match response.status {
        0 => StatusCode::OK,
        code => u16::try_from(code)
            .ok()
            .and_then(|code| StatusCode::from_u16(code).ok())
            .unwrap_or_else(|| {
                tracing::warn!(status = code, "worker returned an invalid status code");
                StatusCode::INTERNAL_SERVER_ERROR
            }),
    };

    let mut out = Response::new(Body::from(response.body));
    *out.status_mut() = status;
    for (name, values) in response.headers {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            tracing::warn!(header = %name, "worker returned an invalid header name");
            continue;
        };
        for value in values.value {
            match header::HeaderValue::try_from(value) {
                Ok(value) => {
                    out.headers_mut().append(name.clone(), value);
                }
                Err(_) => tracing::warn!(header = %name, "worker returned an invalid header value"),
            }
        }
    }
    out
}

async fn dispatch_api(
    handlers: &GatewayHandlers,
    api: &str,
    request: HttpRequest,
) -> GatewayResult {
    let reply = handlers
        .apis
        .handle_request(
            api,
            apis::ServerMessage {
                id: String::new(),
                content: Some(apis::server_message::Content::HttpRequest(request)),
            },
        )
        .await?;
    match reply.content {
        Some(apis::client_message::Content::HttpResponse(response)) => Ok(http_response(response)),
        _ => Err(unexpected_reply("api")),
    }
}

async fn api_root(
    State(handlers): State<GatewayHandlers>,
    Path(api): Path<String>,
    method: Method,
    Query(query): Query<Vec<(String, String)>>,
    headers: HeaderMap,
    body: Bytes,
) -> GatewayResult {
    let request = http_request(method, String::new(), &headers, query, body);
    dispatch_api(&handlers, &api, request).await
}

async fn api_path(
    State(handlers): State<GatewayHandlers>,
    Path((api, path)): Path<(String, String)>,
    method: Method,
    Query(query): Query<Vec<(String, String)>>,
    headers: HeaderMap,
    body: Bytes,
) -> GatewayResult {
    let request = http_request(method, path, &headers, query, body);
    dispatch_api(&handlers, &api, request).await
}

async fn publish(
    State(handlers): State<GatewayHandlers>,
    Path(topic): Path<String>,
    body: Bytes,
) -> GatewayResult {
    let request = topics::ServerMessage {
        id: String::new(),
        content: Some(topics::server_message::Content::MessageRequest(
            MessageRequest {
                topic_name: topic,
                message: Some(Message { payload: body }),
            },
        )),
    };
    match handlers.topics.handle_request(request).await?.content {
        Some(topics::client_message::Content::MessageResponse(response)) => {
            outcome(response.success)
        }
        _ => Err(unexpected_reply("topic")),
    }
}

async fn blob_event(
    State(handlers): State<GatewayHandlers>,
    Path((bucket, event, key)): Path<(String, String, String)>,
) -> GatewayResult {
    let event_type = match event.as_str() {
        "created" => BlobEventType::Created,
        "deleted" => BlobEventType::Deleted,
        other => {
            return Err(GatewayError::new(
                StatusCode::BAD_REQUEST,
                format!("unknown blob event type: {other}"),
            ));
        }
    };
    let request = storage::ServerMessage {
        id: String::new(),
        content: Some(storage::server_message::Content::BlobEventRequest(
            BlobEventRequest {
                bucket_name: bucket,
                blob_event: Some(BlobEvent {
                    key,
                    event_type: event_type as i32,
                }),
            },
        )),
    };
    match handlers.storage.handle_request(request).await?.content {
        Some(storage::client_message::Content::BlobEventResponse(response)) => {
            outcome(response.success)
        }
        _ => Err(unexpected_reply("storage")),
    }
}

async fn websocket_event(
    State(handlers): State<GatewayHandlers>,
    Path((socket, connection_id, event)): Path<(String, String, String)>,
    Query(query): Query<Vec<(String, String)>>,
    body: Bytes,
) -> GatewayResult {
    let websocket_event = match event.as_str() {
        "connect" => WebsocketEvent::Connection(WebsocketConnectionEvent {
            query_params: group_query(query)
                .into_iter()
                .map(|(key, value)| (key, websockets::QueryValue { value }))
                .collect(),
        }),
        "message" => WebsocketEvent::Message(WebsocketMessageEvent { body }),
        "disconnect" => WebsocketEvent::Disconnection(WebsocketDisconnectionEvent {}),
        other => {
            return Err(GatewayError::new(
                StatusCode::BAD_REQUEST,
                format!("unknown websocket event type: {other}"),
            ));
        }
    };
    let request = websockets::ServerMessage {
        id: String::new(),
        content: Some(websockets::server_message::Content::WebsocketEventRequest(
            WebsocketEventRequest {
                socket_name: socket,
                connection_id,
                websocket_event: Some(websocket_event),
            },
        )),
    };
    match handlers.websockets.handle_request(request).await?.content {
        Some(websockets::client_message::Content::WebsocketEventResponse(response)) => {
            let rejected = response
                .connection_response
                .is_some_and(|connection| connection.reject);
            if rejected {
                Ok(StatusCode::UNAUTHORIZED.into_response())
            } else {
                Ok(StatusCode::OK.into_response())
            }
        }
        _ => Err(unexpected_reply("websocket")),
    }
}

async fn list_schedules(State(handlers): State<GatewayHandlers>) -> String {
    handlers
        .schedules
        .schedules()
        .into_iter()
        .map(|(name, cadence)| match cadence {
            Some(Cadence::Every(every)) => format!("{name} every {}\n", every.rate),
            Some(Cadence::Cron(cron)) => format!("{name} cron {}\n", cron.expression),
            None => format!("{name}\n"),
        })
        .collect()
}

async fn trigger_schedule(
    State(handlers): State<GatewayHandlers>,
    Path(schedule): Path<String>,
) -> GatewayResult {
    let request = schedules::ServerMessage {
        id: String::new(),
        content: Some(schedules::server_message::Content::IntervalRequest(
            IntervalRequest {
                schedule_name: schedule,
            },
        )),
    };
    match handlers.schedules.handle_request(request).await?.content {
        Some(schedules::client_message::Content::IntervalResponse(_)) => {
            Ok(StatusCode::OK.into_response())
        }
        _ => Err(unexpected_reply("schedule")),
    }
}

async fn submit_job(
    State(handlers): State<GatewayHandlers>,
    Path(job): Path<String>,
    body: Bytes,
) -> GatewayResult {
    let request = batch::ServerMessage {
        id: String::new(),
        content: Some(batch::server_message::Content::JobRequest(JobRequest {
            job_name: job,
            data: body,
        })),
    };
    match handlers.jobs.handle_request(request).await?.content {
        Some(batch::client_message::Content::JobResponse(response)) => outcome(response.success),
        _ => Err(unexpected_reply("job")),
    }
}

/// Routes every trigger kind onto `handlers`.
pub fn router(handlers: GatewayHandlers) -> Router {
    Router::new()
        .route("/apis/{api}", any(api_root))
        .route("/apis/{api}/", any(api_root))
        .route("/apis/{api}/{*path}", any(api_path))
        .route("/topics/{topic}", post(publish))
        .route("/buckets/{bucket}/{event}/{*key}", post(blob_event))
        .route(
            "/websockets/{socket}/{connection_id}/{event}",
            post(websocket_event),
        )
        .route("/schedules", get(list_schedules))
        .route("/schedules/{schedule}", post(trigger_schedule))
        .route("/jobs/{job}", post(submit_job))
        .with_state(handlers)
}

/// HTTP gateway for local development.
pub struct DevGateway {
    address: SocketAddr,
    shutdown: CancellationToken,
}

impl DevGateway {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            shutdown: CancellationToken::new(),
        }
    }
}

#[tonic::async_trait]
impl Gateway for DevGateway {
    async fn start(&self, handlers: GatewayHandlers) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.address).await?;
        tracing::info!(address = %listener.local_addr()?, "dev gateway listening");
        axum::serve(listener, router(handlers))
            .with_graceful_shutdown(self.shutdown.clone().cancelled_owned())
            .await?;
        tracing::info!("dev gateway stopped");
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.shutdown.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::workers::{
        apis::ApiRouter, jobs::JobManager, schedules::ScheduleManager,
        storage::StorageListenerManager, testing::connect, topics::SubscriberManager,
        websockets::WebsocketManager,
    };
    use axum::{body::to_bytes, http::Request};
    use membrane_core::proto::{
        apis::{HttpResponse, RegistrationRequest},
        schedules::ScheduleEvery,
        websockets::{WebsocketConnectionResponse, WebsocketEventResponse, WebsocketEventType},
    };
    use std::sync::Arc;
    use tower::ServiceExt;

    #[derive(Clone, Default)]
    struct Managers {
        apis: ApiRouter,
        storage: StorageListenerManager,
        topics: SubscriberManager,
        websockets: WebsocketManager,
        schedules: ScheduleManager,
        jobs: JobManager,
    }

    impl Managers {
        fn handlers(&self) -> GatewayHandlers {
            GatewayHandlers {
                apis: Arc::new(self.apis.clone()),
                storage: Arc::new(self.storage.clone()),
                topics: Arc::new(self.topics.clone()),
                websockets: Arc::new(self.websockets.clone()),
                schedules: Arc::new(self.schedules.clone()),
                jobs: Arc::new(self.jobs.clone()),
            }
        }
    }

    async fn call(app: Router, request: Request<Body>) -> (StatusCode, HeaderMap, String) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, String::from_utf8(body.to_vec()).unwrap())
    }

    fn post_to(uri: &str, body: &'static str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn http_calls_are_translated_for_api_workers() {
        let managers = Managers::default();
        let registration = apis::ClientMessage {
            id: String::new(),
            content: Some(apis::client_message::Content::RegistrationRequest(
                RegistrationRequest {
                    api: "main".to_string(),
                    path: "/pets/:id".to_string(),
                    methods: vec!["PUT".to_string()],
                },
            )),
        };
        let (worker, ack) = connect(managers.apis.clone(), registration).await;
        ack.unwrap();
        let _worker = worker.respond_with(|request: apis::ServerMessage| {
            let Some(apis::server_message::Content::HttpRequest(http)) = request.content else {
                panic!("expected an HTTP request");
            };
            let summary = format!(
                "{} {} id={} q={:?} h={:?} body={}",
                http.method,
                http.path,
                http.path_params["id"],
                http.query_params["tag"].value,
                http.headers["x-trace"].value,
                String::from_utf8_lossy(&http.body),
            );
            let mut headers = HashMap::new();
            headers.insert(
                "content-type".to_string(),
                apis::HeaderValue {
                    value: vec!["text/plain".to_string()],
                },
            );
            apis::ClientMessage {
                id: String::new(),
                content: Some(apis::client_message::Content::HttpResponse(HttpResponse {
                    status: 201,
                    headers,
                    body: summary.into(),
                })),
            }
        });

        let request = Request::builder()
            .method(Method::PUT)
            .uri("/apis/main/pets/7?tag=a&tag=b")
            .header("x-trace", "abc")
            .body(Body::from("rex"))
            .unwrap();
        let (status, headers, body) = call(router(managers.handlers()), request).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(headers["content-type"], "text/plain");
        assert_eq!(
            body,
            r#"PUT /pets/7 id=7 q=["a", "b"] h=["abc"] body=rex"#
        );
    }

    #[tokio::test]
    async fn routing_misses_are_not_found() {
        let app = router(Managers::default().handlers());
        for uri in ["/apis/main/pets", "/topics/orders", "/schedules/nightly", "/jobs/resize"] {
            let (status, _, body) = call(app.clone(), post_to(uri, "")).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
            assert!(body.starts_with("no worker registered for"), "{body}");
        }
    }

    #[tokio::test]
    async fn unknown_event_kinds_are_bad_requests() {
        let app = router(Managers::default().handlers());
        let (status, _, _) = call(app.clone(), post_to("/buckets/images/renamed/a.png", "")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _, _) = call(app, post_to("/websockets/chat/c1/ping", "")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn failed_deliveries_are_server_errors() {
        let managers = Managers::default();
        let registration = topics::ClientMessage {
            id: String::new(),
            content: Some(topics::client_message::Content::RegistrationRequest(
                topics::RegistrationRequest {
                    topic_name: "orders".to_string(),
                },
            )),
        };
        let (worker, ack) = connect(managers.topics.clone(), registration).await;
        ack.unwrap();
        let _worker = worker.respond_with(|request: topics::ServerMessage| {
            let Some(topics::server_message::Content::MessageRequest(message)) = request.content
            else {
                panic!("expected a message request");
            };
            let payload = message.message.unwrap_or_default().payload;
            topics::ClientMessage {
                id: String::new(),
                content: Some(topics::client_message::Content::MessageResponse(
                    topics::MessageResponse {
                        success: &payload[..] == b"ok",
                    },
                )),
            }
        });

        let app = router(managers.handlers());
        let (status, _, _) = call(app.clone(), post_to("/topics/orders", "ok")).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let (status, _, _) = call(app, post_to("/topics/orders", "boom")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn rejected_connections_are_unauthorized() {
        let managers = Managers::default();
        let registration = websockets::ClientMessage {
            id: String::new(),
            content: Some(websockets::client_message::Content::RegistrationRequest(
                websockets::RegistrationRequest {
                    socket_name: "chat".to_string(),
                    event_type: WebsocketEventType::Connect as i32,
                },
            )),
        };
        let (worker, ack) = connect(managers.websockets.clone(), registration).await;
        ack.unwrap();
        let _worker = worker.respond_with(|request: websockets::ServerMessage| {
            let Some(websockets::server_message::Content::WebsocketEventRequest(event)) =
                request.content
            else {
                panic!("expected a websocket event");
            };
            let Some(WebsocketEvent::Connection(connection)) = event.websocket_event else {
                panic!("expected a connection event");
            };
            let reject = !connection.query_params.contains_key("token");
            websockets::ClientMessage {
                id: String::new(),
                content: Some(websockets::client_message::Content::WebsocketEventResponse(
                    WebsocketEventResponse {
                        connection_response: Some(WebsocketConnectionResponse { reject }),
                    },
                )),
            }
        });

        let app = router(managers.handlers());
        let (status, _, _) = call(app.clone(), post_to("/websockets/chat/c1/connect", "")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _, _) = call(
            app,
            post_to("/websockets/chat/c1/connect?token=secret", ""),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn schedules_are_listed_with_their_cadence() {
        let managers = Managers::default();
        let registration = schedules::ClientMessage {
            id: String::new(),
            content: Some(schedules::client_message::Content::RegistrationRequest(
                schedules::RegistrationRequest {
                    schedule_name: "cleanup".to_string(),
                    cadence: Some(Cadence::Every(ScheduleEvery {
                        rate: "5 minutes".to_string(),
                    })),
                },
            )),
        };
        let (worker, ack) = connect(managers.schedules.clone(), registration).await;
        ack.unwrap();
        let _worker = worker.respond_with(|_| schedules::ClientMessage {
            id: String::new(),
            content: Some(schedules::client_message::Content::IntervalResponse(
                schedules::IntervalResponse {},
            )),
        });

        let app = router(managers.handlers());
        let listing = Request::builder()
            .uri("/schedules")
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = call(app.clone(), listing).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "cleanup every 5 minutes\n");

        let (status, _, _) = call(app, post_to("/schedules/cleanup", "")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn stop_ends_a_running_gateway() {
        let gateway = Arc::new(DevGateway::new(SocketAddr::from(([127, 0, 0, 1], 0))));
        let handlers = Managers::default().handlers();
        let running = tokio::spawn({
            let gateway = Arc::clone(&gateway);
            async move { gateway.start(handlers).await }
        });

        gateway.stop().await.unwrap();
        running.await.unwrap().unwrap();
    }
}

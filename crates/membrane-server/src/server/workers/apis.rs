//! HTTP API routing.
//!
//! Workers register a path template and a set of methods for a named API.
//! Templates are split on `/` (empty segments ignored) and `:name` segments
//! capture path parameters. A request is routed to the first registered
//! route, in registration order, whose method set contains the request method
//! and whose template has the same number of segments with every literal
//! segment equal. There is no specificity ordering.

use super::{
    WorkerConnection, WorkerCount, WorkerOptions, WorkerRegistry, WorkerStream, dispatch,
    serve_worker,
};
use membrane_core::{
    Error, Result,
    proto::apis::{
        ClientMessage, HttpRequest, RegistrationRequest, RegistrationResponse, ServerMessage,
        api_server::Api, client_message, server_message,
    },
};
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

pub type ApiWorker = WorkerConnection<ServerMessage, ClientMessage>;

/// Routes HTTP requests to API workers.
#[tonic::async_trait]
pub trait ApiRequestHandler: WorkerCount + Send + Sync {
    /// Forwards `request`, which must carry an HTTP request, to the worker
    /// serving `api` and returns the worker's reply.
    ///
    /// Path parameters captured by the matched template are added to the
    /// request unless the caller already supplied them.
    async fn handle_request(&self, api: &str, request: ServerMessage) -> Result<ClientMessage>;
}

struct RouteWorker {
    template: String,
    segments: Vec<String>,
    methods: Vec<String>,
    worker: ApiWorker,
}

impl RouteWorker {
    fn new(registration: RegistrationRequest, worker: ApiWorker) -> Self {
        Self {
            segments: split_path(&registration.path).map(str::to_owned).collect(),
            template: registration.path,
            methods: registration.methods,
            worker,
        }
    }

    fn supports(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m == method)
    }

    /// Path parameters captured from `path`, or `None` if the template does
    /// not match.
    fn path_params(&self, path: &str) -> Option<HashMap<String, String>> {
        let actual: Vec<&str> = split_path(path).collect();
        if actual.len() != self.segments.len() {
            return None;
        }

        let mut params = HashMap::new();
        for (template, actual) in self.segments.iter().zip(actual) {
            match template.strip_prefix(':') {
                Some(name) => {
                    params.insert(name.to_owned(), actual.to_owned());
                }
                None if template == actual => {}
                None => return None,
            }
        }
        Some(params)
    }
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}

/// Manager for API workers, keyed by API name.
#[derive(Clone, Default)]
pub struct ApiRouter {
    apis: Arc<RwLock<HashMap<String, Vec<RouteWorker>>>>,
    options: WorkerOptions,
}

impl ApiRouter {
    pub fn new(options: WorkerOptions) -> Self {
        Self {
            apis: Arc::default(),
            options,
        }
    }

    /// Picks the worker for `request` and fills in its path parameters.
    fn route(&self, api: &str, request: &mut HttpRequest) -> Result<ApiWorker> {
        let apis = self.apis.read();
        let matched = apis.get(api).and_then(|routes| {
            routes.iter().find_map(|route| {
                if !route.supports(&request.method) {
                    return None;
                }
                route.path_params(&request.path).map(|params| (route, params))
            })
        });

        let Some((route, params)) = matched else {
            return Err(Error::NoWorker {
                context: format!(
                    "Api {} on route: {} - {}",
                    api, request.method, request.path
                ),
            });
        };

        tracing::trace!(api, template = %route.template, "matched route");
        for (name, value) in params {
            request.path_params.entry(name).or_insert(value);
        }
        Ok(Arc::clone(&route.worker))
    }
}

impl WorkerCount for ApiRouter {
    fn worker_count(&self) -> usize {
        self.apis.read().values().map(Vec::len).sum()
    }
}

impl WorkerRegistry for ApiRouter {
    type Request = ServerMessage;
    type Response = ClientMessage;
    type Registration = RegistrationRequest;

    const KIND: &'static str = "api";

    fn registration(message: ClientMessage) -> Option<RegistrationRequest> {
        match message.content {
            Some(client_message::Content::RegistrationRequest(registration)) => Some(registration),
            _ => None,
        }
    }

    fn ack() -> ServerMessage {
        ServerMessage {
            id: String::new(),
            content: Some(server_message::Content::RegistrationResponse(
                RegistrationResponse {},
            )),
        }
    }

    fn register(&self, registration: RegistrationRequest, worker: ApiWorker) -> Result<()> {
        tracing::info!(
            api = %registration.api,
            path = %registration.path,
            methods = ?registration.methods,
            "registering route"
        );
        let api = registration.api.clone();
        self.apis
            .write()
            .entry(api)
            .or_default()
            .push(RouteWorker::new(registration, worker));
        Ok(())
    }

    fn unregister(&self, worker: &ApiWorker) {
        let mut apis = self.apis.write();
        for routes in apis.values_mut() {
            routes.retain(|route| !Arc::ptr_eq(&route.worker, worker));
        }
        apis.retain(|_, routes| !routes.is_empty());
    }
}

#[tonic::async_trait]
impl ApiRequestHandler for ApiRouter {
    #[tracing::instrument(skip(self, request), fields(trigger = "api"))]
    async fn handle_request(&self, api: &str, mut request: ServerMessage) -> Result<ClientMessage> {
        let Some(server_message::Content::HttpRequest(http)) = request.content.as_mut() else {
            return Err(Error::InvalidRequest {
                reason: "API requests must carry an HTTP request".to_string(),
            });
        };
        let worker = self.route(api, http)?;
        dispatch(Self::KIND, &worker, request, self.options.request_timeout).await
    }
}

#[tonic::async_trait]
impl Api for ApiRouter {
    type ServeStream = WorkerStream<ServerMessage>;

    async fn serve(
        &self,
        request: Request<Streaming<ClientMessage>>,
    ) -> core::result::Result<Response<Self::ServeStream>, Status> {
        let (tx, rx) = mpsc::channel(self.options.stream_buffer_size);
        tokio::spawn(serve_worker(self.clone(), request.into_inner(), tx));
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

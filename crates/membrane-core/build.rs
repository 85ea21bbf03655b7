/// Generates the gRPC client and server stubs for every worker-facing service.
///
/// The message types are declared by hand under `src/proto` with `prost`
/// derives, so no `.proto` sources (and no `protoc`) are involved. Each service
/// exposes a single bidirectional streaming method: the worker opens the stream
/// with a registration request and then answers the triggers the membrane
/// forwards to it.
///
/// # Output
///
/// One file per service is written to `OUT_DIR`, named
/// `<package>.<service>.rs`, and pulled in by the matching `proto` module:
///
/// ```rust,ignore
/// include!(concat!(env!("OUT_DIR"), "/membrane.apis.v1.Api.rs"));
/// ```
use tonic_build::manual::{Builder, Method, Service};

const CODEC: &str = "tonic_prost::ProstCodec";

/// `(package, service, method, route, proto module)`
const SERVICES: &[(&str, &str, &str, &str, &str)] = &[
    ("membrane.apis.v1", "Api", "serve", "Serve", "apis"),
    (
        "membrane.storage.v1",
        "StorageListener",
        "listen",
        "Listen",
        "storage",
    ),
    (
        "membrane.topics.v1",
        "Subscriber",
        "subscribe",
        "Subscribe",
        "topics",
    ),
    (
        "membrane.websockets.v1",
        "WebsocketHandler",
        "handle_events",
        "HandleEvents",
        "websockets",
    ),
    (
        "membrane.schedules.v1",
        "Schedules",
        "schedule",
        "Schedule",
        "schedules",
    ),
    ("membrane.batch.v1", "Job", "handle_job", "HandleJob", "batch"),
];

fn main() {
    let services: Vec<Service> = SERVICES
        .iter()
        .map(|(package, name, method, route, module)| {
            Service::builder()
                .name(*name)
                .package(*package)
                .method(
                    Method::builder()
                        .name(*method)
                        .route_name(*route)
                        .input_type(format!("crate::proto::{module}::ClientMessage"))
                        .output_type(format!("crate::proto::{module}::ServerMessage"))
                        .codec_path(CODEC)
                        .client_streaming()
                        .server_streaming()
                        .build(),
                )
                .build()
        })
        .collect();

    Builder::new().compile(&services);

    println!("cargo:rerun-if-changed=build.rs");
}

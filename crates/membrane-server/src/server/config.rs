use crate::server::workers::WorkerOptions;
use anyhow::{Context, bail};
use clap::Parser;
use core::{net::SocketAddr, time::Duration};

/// Runtime configuration for the `membrane` binary.
///
/// Every option can be given on the command line or through the environment
/// (a `.env` file is honoured). Anything after the options is the
/// application command the membrane starts and supervises.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "membrane",
    version,
    about = "Routes external triggers to application workers over streaming gRPC"
)]
pub struct CliArgs {
    /// Address the worker gRPC service listens on. Exported to the
    /// application as `SERVICE_ADDRESS`.
    ///
    /// Environment variable: `SERVICE_ADDRESS`
    #[arg(long, env = "SERVICE_ADDRESS", default_value_t = String::from("127.0.0.1:50051"))]
    pub service_address: String,

    /// Workers that must register before triggers are accepted.
    ///
    /// Environment variable: `MIN_WORKERS`
    #[arg(long, env = "MIN_WORKERS", default_value_t = 1)]
    pub min_workers: usize,

    /// Seconds to wait for `min_workers` registrations.
    ///
    /// Environment variable: `WORKER_TIMEOUT`
    #[arg(long, env = "WORKER_TIMEOUT", default_value_t = 10)]
    pub worker_timeout: u64,

    /// Maximum concurrent worker streams. Raised to `min_workers` when lower.
    ///
    /// Environment variable: `MAX_WORKERS`
    #[arg(long, env = "MAX_WORKERS", default_value_t = 300)]
    pub max_workers: u32,

    /// Seconds a single trigger may wait for its worker. `0` waits forever.
    ///
    /// Environment variable: `WORKER_REQUEST_TIMEOUT`
    #[arg(long, env = "WORKER_REQUEST_TIMEOUT", default_value_t = 0)]
    pub worker_request_timeout: u64,

    /// Capacity of the outbound buffer of each worker stream.
    ///
    /// Environment variable: `STREAM_BUFFER_SIZE`
    #[arg(long, env = "STREAM_BUFFER_SIZE", default_value_t = 16)]
    pub stream_buffer_size: usize,

    /// Address the local HTTP gateway listens on.
    ///
    /// Environment variable: `GATEWAY_ADDRESS`
    #[arg(long, env = "GATEWAY_ADDRESS", default_value_t = String::from("127.0.0.1:4000"))]
    pub gateway_address: String,

    /// Command run to completion before the application starts, split on
    /// whitespace. May be repeated; the environment variable takes a
    /// `;`-separated list.
    ///
    /// Environment variable: `PRE_COMMANDS`
    #[arg(long = "pre-command", env = "PRE_COMMANDS", value_delimiter = ';')]
    pub pre_commands: Vec<String>,

    /// Application command and its arguments.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub service_address: SocketAddr,
    pub min_workers: usize,
    pub worker_timeout: Duration,
    pub max_workers: u32,
    pub worker_request_timeout: Option<Duration>,
    pub stream_buffer_size: usize,
    pub gateway_address: SocketAddr,
    pub pre_commands: Vec<Vec<String>>,
    pub command: Vec<String>,
}

impl ServerConfig {
    /// Options shared by every manager.
    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            request_timeout: self.worker_request_timeout,
            stream_buffer_size: self.stream_buffer_size,
        }
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let service_address: SocketAddr = args
            .service_address
            .parse()
            .with_context(|| format!("SERVICE_ADDRESS is not a socket address: {}", args.service_address))?;
        let gateway_address: SocketAddr = args
            .gateway_address
            .parse()
            .with_context(|| format!("GATEWAY_ADDRESS is not a socket address: {}", args.gateway_address))?;

        if args.stream_buffer_size == 0 {
            bail!("STREAM_BUFFER_SIZE must be greater than 0");
        }

        if args.min_workers > 0 && args.worker_timeout == 0 {
            bail!(
                "WORKER_TIMEOUT must be greater than 0 when waiting for {} workers",
                args.min_workers
            );
        }

        let min_workers = u32::try_from(args.min_workers)
            .with_context(|| format!("MIN_WORKERS ({}) is too large", args.min_workers))?;
        let max_workers = args.max_workers.max(min_workers).max(1);

        let pre_commands = args
            .pre_commands
            .iter()
            .map(|command| {
                let argv: Vec<String> = command.split_whitespace().map(str::to_owned).collect();
                if argv.is_empty() {
                    bail!("PRE_COMMANDS contains an empty command");
                }
                Ok(argv)
            })
            .collect::<anyhow::Result<_>>()?;

        let worker_request_timeout =
            (args.worker_request_timeout > 0).then(|| Duration::from_secs(args.worker_request_timeout));

        Ok(Self {
            service_address,
            min_workers: args.min_workers,
            worker_timeout: Duration::from_secs(args.worker_timeout),
            max_workers,
            worker_request_timeout,
            stream_buffer_size: args.stream_buffer_size,
            gateway_address,
            pre_commands,
            command: args.command,
        })
    }
}

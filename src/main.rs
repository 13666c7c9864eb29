// src/main.rs
//! The reference consumer: a libnetwork-style remote network driver
//! plugin served over a UNIX socket or a TCP port.

use clap::Parser;
use mazurka::{MazurkaResult, Reactor, Router, Server};
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "mazurka", version)]
#[command(about = "Coroutine-per-connection network driver plugin server")]
#[command(group(clap::ArgGroup::new("endpoint").required(true).args(["unix", "tcp"])))]
struct Cli {
    /// Serve over a UNIX socket at this path
    #[arg(long, value_name = "PATH")]
    unix: Option<PathBuf>,

    /// Serve over this TCP port
    #[arg(long, value_name = "PORT")]
    tcp: Option<u16>,

    /// Per-connection coroutine stack size in KiB
    #[arg(long, default_value_t = 256, value_name = "KIB")]
    stack_kib: usize,
}

#[derive(Serialize)]
struct Activation {
    #[serde(rename = "Implements")]
    implements: Vec<&'static str>,
}

#[derive(Serialize)]
struct Capabilities {
    #[serde(rename = "Scope")]
    scope: &'static str,
}

fn plugin_routes() -> Router {
    let mut router = Router::new();

    router.handle("/Plugin.Activate", |_req, resp| {
        match serde_json::to_vec(&Activation {
            implements: vec!["NetworkDriver"],
        }) {
            Ok(body) => {
                resp.set_body(body);
                true
            }
            Err(_) => false,
        }
    });

    router.handle("/NetworkDriver.GetCapabilities", |_req, resp| {
        match serde_json::to_vec(&Capabilities { scope: "local" }) {
            Ok(body) => {
                resp.set_body(body);
                true
            }
            Err(_) => false,
        }
    });

    // the driver keeps no state; every mutation is acknowledged with an
    // empty object
    for uri in [
        "/NetworkDriver.CreateNetwork",
        "/NetworkDriver.DeleteNetwork",
        "/NetworkDriver.CreateEndpoint",
        "/NetworkDriver.EndpointOperInfo",
        "/NetworkDriver.DeleteEndpoint",
        "/NetworkDriver.Join",
        "/NetworkDriver.Leave",
    ] {
        router.handle(uri, |_req, resp| {
            resp.set_body(&b"{}"[..]);
            true
        });
    }

    router
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn serve(cli: &Cli) -> MazurkaResult<()> {
    let reactor = Reactor::new()?;
    let router = plugin_routes();

    let server = match (&cli.unix, cli.tcp) {
        (Some(path), _) => Server::bind_unix(path, router)?,
        (_, Some(port)) => Server::bind_tcp(port, router)?,
        _ => unreachable!("clap enforces the endpoint group"),
    };
    let mut server = server.stack_size(cli.stack_kib * 1024);
    unsafe { server.attach(&reactor)? };

    let stop = reactor.stop_handle();
    ctrlc::set_handler(move || stop.stop()).map_err(io::Error::other)?;

    let result = reactor.run();
    server.drain();
    result
}

fn main() {
    init_logging();
    let cli = Cli::parse();
    if let Err(err) = serve(&cli) {
        error!(error = %err, "server failed");
        std::process::exit(1);
    }
}

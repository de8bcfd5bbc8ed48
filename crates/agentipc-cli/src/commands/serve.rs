use agentipc_core::{paths, version::version_string, IpcConfig};
use agentipc_transport::{IpcCallbacks, IpcTransport};
use crossbeam_channel::{bounded, Sender};
use miette::{IntoDiagnostic, Result};
use serde::Serialize;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

/// Name of the server that accepts agent commands.
pub const CONTROL_SERVER: &str = "control";

const DEFAULT_ECHO_SERVER: &str = "echo";

/// Startup line printed on stdout with `--json`.
#[derive(Serialize)]
struct ServeStarted<'a> {
    ok: bool,
    socket_dir: PathBuf,
    servers: &'a [String],
    control: &'a str,
}

/// Run the agent in the foreground until the control server is told to stop.
pub fn run(config: &IpcConfig, names: &[String], json: bool) -> Result<()> {
    let names: Vec<String> = if names.is_empty() {
        vec![DEFAULT_ECHO_SERVER.to_string()]
    } else {
        names.to_vec()
    };

    let transport = IpcTransport::new();
    transport.start(config).into_diagnostic()?;

    for name in &names {
        if let Err(e) = transport.create_server(name, echo_callbacks()) {
            let _ = transport.shutdown();
            return Err(e).into_diagnostic();
        }
    }

    let (stop_tx, stop_rx) = bounded::<()>(1);
    if let Err(e) = transport.create_server(CONTROL_SERVER, control_callbacks(stop_tx)) {
        let _ = transport.shutdown();
        return Err(e).into_diagnostic();
    }

    let socket_dir = transport.socket_dir().unwrap_or_default();
    if json {
        let started = ServeStarted {
            ok: true,
            socket_dir: socket_dir.clone(),
            servers: &names,
            control: CONTROL_SERVER,
        };
        println!("{}", serde_json::to_string(&started).into_diagnostic()?);
        io::stdout().flush().into_diagnostic()?;
    } else {
        eprintln!("agent listening in {}", socket_dir.display());
        eprintln!("servers: {}", names.join(", "));
        eprintln!(
            "hint: export {}={} for clients",
            paths::SOCKET_DIR_ENV,
            socket_dir.display()
        );
        io::stderr().flush().into_diagnostic()?;
    }

    // Blocks until a `shutdown` request arrives
    let _ = stop_rx.recv();
    tracing::info!("shutdown requested");

    transport.shutdown().into_diagnostic()
}

fn echo_callbacks() -> Arc<dyn IpcCallbacks> {
    Arc::new(|request: &[u8]| Ok(Some(request.to_vec())))
}

/// Commands understood by the control server.
///
/// The callbacks run on the transport's workers and must not call back into
/// the transport; stopping is signalled to the main thread instead.
fn control_callbacks(stop: Sender<()>) -> Arc<dyn IpcCallbacks> {
    Arc::new(move |request: &[u8]| {
        let command = String::from_utf8_lossy(request);
        let reply = match command.trim() {
            "ping" => "pong".to_string(),
            "version" => version_string(),
            "shutdown" => {
                let _ = stop.try_send(());
                "stopping".to_string()
            }
            other => {
                tracing::debug!(command = other, "unknown control command");
                format!("error: unknown command {other:?}")
            }
        };
        Ok(Some(reply.into_bytes()))
    })
}

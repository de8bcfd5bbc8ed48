use agentipc_core::IpcConfig;
use agentipc_transport::{policy, IpcClient};
use miette::{IntoDiagnostic, Result};
use serde::Serialize;
use std::io::{self, Write};
use std::time::Duration;

/// Send result for JSON output.
#[derive(Serialize)]
struct SendResult {
    ok: bool,
    server: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Run the send command.
///
/// Connects to server `name`, sends `payload` as a single request and prints
/// whatever comes back before the server closes the connection.
pub fn run(
    config: &IpcConfig,
    name: &str,
    payload: &[u8],
    timeout_ms: u64,
    json: bool,
) -> Result<()> {
    match exchange(config, name, payload, timeout_ms) {
        Ok(response) => {
            if json {
                let result = SendResult {
                    ok: true,
                    server: name.to_string(),
                    response: Some(String::from_utf8_lossy(&response).into_owned()),
                    bytes: Some(response.len()),
                    error: None,
                };
                println!("{}", serde_json::to_string_pretty(&result).into_diagnostic()?);
            } else {
                let mut out = io::stdout().lock();
                out.write_all(&response).into_diagnostic()?;
                if !response.ends_with(b"\n") {
                    out.write_all(b"\n").into_diagnostic()?;
                }
            }
            Ok(())
        }
        Err(e) => {
            if json {
                let result = SendResult {
                    ok: false,
                    server: name.to_string(),
                    response: None,
                    bytes: None,
                    error: Some(e.to_string()),
                };
                println!("{}", serde_json::to_string_pretty(&result).into_diagnostic()?);
                std::process::exit(1);
            }
            Err(e).into_diagnostic()
        }
    }
}

fn exchange(
    config: &IpcConfig,
    name: &str,
    payload: &[u8],
    timeout_ms: u64,
) -> agentipc_core::Result<Vec<u8>> {
    let dir = policy::resolve_directory(&config.socket_dir)?;
    let mut client = IpcClient::connect(&dir, name)?;
    client.set_timeout(Some(Duration::from_millis(timeout_ms.max(1))))?;
    tracing::debug!(path = %client.path().display(), bytes = payload.len(), "sending request");

    client.send(payload)?;
    client.finish()?;
    client.receive(config.max_message_size)
}

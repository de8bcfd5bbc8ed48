use agentipc_core::IpcConfig;
use miette::{IntoDiagnostic, Result};
use std::path::Path;

/// Print the effective configuration, optionally persisting it to `path`.
pub fn run(config: &IpcConfig, path: &Path, save: bool, json: bool) -> Result<()> {
    if save {
        config.save(path).into_diagnostic()?;
        if !json {
            eprintln!("wrote {}", path.display());
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(config).into_diagnostic()?);
    } else {
        println!("Config file:      {}", path.display());
        println!("Transport:        {}", config.ipc_type.as_str());
        println!("Socket directory: {}", config.socket_dir.display());
        println!("Directory mode:   {}", config.dir_mode.as_str());
        println!("Max message size: {} bytes", config.max_message_size);
        match config.worker_threads {
            Some(n) => println!("Worker threads:   {n}"),
            None => println!("Worker threads:   auto"),
        }
    }
    Ok(())
}

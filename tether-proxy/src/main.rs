use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tether_core::config::{config_path, BridgeConfig};
use tether_core::lsp::{LspEndpoint, LspRegistry, StdioLspProxy};
use tether_core::{Error, Result};

/// Serve a stdio language server on a local port until stdin closes.
#[derive(Parser, Debug)]
#[command(name = "tether-lsp-proxy", about, long_about = None)]
struct Cli {
    /// Read server mappings from this file instead of the user config
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Launch the server configured for this file extension
    #[arg(short = 'e', long = "extension", value_name = "EXT")]
    extension: Option<String>,

    /// Server command line, after `--`
    #[arg(last = true, required_unless_present = "extension")]
    command: Vec<String>,
}

fn resolve(cli: &Cli) -> Result<LspEndpoint> {
    if !cli.command.is_empty() {
        let proxy = StdioLspProxy::new(cli.command.clone())?;
        return Ok(LspEndpoint::Local(Arc::new(proxy)));
    }

    let config = match &cli.config {
        Some(path) => BridgeConfig::load_from(path)?,
        None => BridgeConfig::load(),
    };
    let config_file = || {
        cli.config
            .clone()
            .or_else(config_path)
            .unwrap_or_default()
    };
    let ext = cli.extension.as_deref().ok_or_else(|| Error::Config {
        path: config_file(),
        reason: "no command or extension given".to_string(),
    })?;
    LspRegistry::from_config(&config)
        .resolve_for_extension(ext)
        .ok_or_else(|| Error::Config {
            path: config_file(),
            reason: format!("no language server configured for '{}'", ext),
        })
}

fn run(cli: Cli) -> Result<()> {
    let endpoint = resolve(&cli)?;
    if let Some(proxy) = endpoint.proxy() {
        proxy.start();
    }

    let mut stdout = io::stdout();
    writeln!(stdout, "{}", endpoint.lsp_path()).map_err(|e| Error::file_io("<stdout>", e))?;
    stdout.flush().map_err(|e| Error::file_io("<stdout>", e))?;

    // Remote servers need nothing kept alive.
    let Some(proxy) = endpoint.proxy() else {
        return Ok(());
    };
    log::info!("serving {} until stdin closes", endpoint.lsp_path());
    if let Err(e) = io::copy(&mut io::stdin(), &mut io::sink()) {
        log::warn!("stdin read failed: {}", e);
    }
    proxy.stop();
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            eprintln!("tether-lsp-proxy: {}", e);
            ExitCode::FAILURE
        }
    }
}

pub mod mcp_client;

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Context;
use tracing_subscriber::fmt::MakeWriter;

use mcp_client::{ConnectionManager, ServerStatus};

/// Environment variable naming the settings file.
pub const CONFIG_ENV: &str = "TOOLMESH_CONFIG";

/// Set to `1` to write JSON log lines instead of plain text.
pub const LOG_JSON_ENV: &str = "TOOLMESH_LOG_JSON";

/// Return the platform-standard data directory for Toolmesh.
///
/// - macOS: `~/Library/Application Support/com.toolmesh/`
/// - Windows: `{FOLDERID_RoamingAppData}\com.toolmesh\`
/// - Linux: `$XDG_DATA_HOME/com.toolmesh/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.toolmesh/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("com.toolmesh");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolmesh")
}

/// Pick the settings file: explicit argument, then `TOOLMESH_CONFIG`, then
/// `servers.json` in the data directory.
pub fn resolve_config_path(arg: Option<PathBuf>) -> PathBuf {
    if let Some(path) = arg {
        return path;
    }
    match std::env::var(CONFIG_ENV) {
        Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
        _ => data_dir().join("servers.json"),
    }
}

/// Install the global subscriber, logging to `toolmesh.log` in `log_dir`.
///
/// The previous three logs are kept as `toolmesh.log.1` to `.3`. `RUST_LOG`
/// overrides the default filter and `TOOLMESH_LOG_JSON=1` switches to JSON
/// lines.
pub fn init_tracing(log_dir: &Path) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;

    let log_path = log_dir.join("toolmesh.log");

    rotate_log_file(&log_path, 3);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open {}", log_path.display()))?;

    let flushing_writer = FlushingWriter::new(log_file);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("toolmesh=info,warn"));

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(flushing_writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false);

    let installed = if std::env::var(LOG_JSON_ENV).is_ok_and(|v| v == "1") {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== Toolmesh starting ==="
    );
    Ok(())
}

/// Shift `toolmesh.log` to `.1`, `.1` to `.2`, and so on, dropping whatever
/// would land past `.{keep}`. Gaps in the chain are fine.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let numbered = |n: u32| PathBuf::from(format!("{}.{n}", base_path.display()));

    let _ = std::fs::remove_file(numbered(keep));
    for n in (1..keep).rev() {
        let _ = std::fs::rename(numbered(n), numbered(n + 1));
    }
    if base_path.exists() {
        let _ = std::fs::rename(base_path, numbered(1));
    }
}

/// Log file handle that flushes after every write, so the tail of the log
/// survives a crash.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<Mutex<File>>,
}

impl FlushingWriter {
    fn new(file: File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }

    fn file(&self) -> io::Result<MutexGuard<'_, File>> {
        self.file
            .lock()
            .map_err(|e| io::Error::other(format!("log file lock poisoned: {e}")))
    }
}

impl Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut file = self.file()?;
        let written = file.write(buf)?;
        file.flush()?;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file()?.flush()
    }
}

impl<'a> MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// One line per server for the terminal.
pub fn format_status_line(status: &ServerStatus) -> String {
    let mut line = format!(
        "{:<20} {:<13} {:>3} tools",
        status.id,
        status.state.as_str(),
        status.tool_count()
    );
    if let Some(err) = &status.last_error {
        line.push_str(&format!("  ({err})"));
    }
    line
}

/// Run the host: load settings, connect every auto-connect server, report
/// status changes, and shut down on Ctrl-C.
pub async fn run(config_arg: Option<PathBuf>) -> anyhow::Result<()> {
    init_tracing(&data_dir())?;

    let config_path = resolve_config_path(config_arg);
    let settings = mcp_client::load_settings(&config_path)
        .with_context(|| format!("failed to load settings from {}", config_path.display()))?;

    tracing::info!(
        path = %config_path.display(),
        servers = settings.servers.len(),
        "settings loaded"
    );

    let manager = ConnectionManager::with_default_transports(settings)?;
    manager.on_status_change(|status| {
        tracing::info!(
            server = %status.id,
            state = %status.state,
            tools = status.tool_count(),
            error = ?status.last_error,
            "server status"
        );
    });

    let errors = manager.start().await;
    for (server, err) in &errors {
        tracing::warn!(server = %server, error = %err, "server failed to start (non-fatal)");
    }

    for status in manager.statuses() {
        println!("{}", format_status_line(&status));
    }
    let registry = manager.registry();
    println!(
        "{} tools available, {} conflicts",
        registry.len(),
        registry.conflicts().len()
    );
    for conflict in registry.conflicts() {
        println!("  {}", mcp_client::McpError::from(conflict));
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    tracing::info!("shutting down");
    manager.shutdown().await;
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

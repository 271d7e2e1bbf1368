//! # tds-runner
//!
//! Command-line streamer client.
//!
//! Loads a JSON configuration file, obtains the user principal, logs in to the
//! streamer and registers every configured subscription. Records are logged and
//! optionally appended to a JSON-lines dump file until Ctrl+C, or until the
//! session is lost, in which case the process exits with an error.
//!
//! # Usage
//!
//! ```bash
//! tds-runner config.json --log-level debug --dump quotes.jsonl
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tds_core::config::{AppConfig, PrincipalSource};
use tds_core::logging::{LogFormat, LogOptions};
use tds_stream::{
    CloseReason, FilePrincipalProvider, PrincipalProvider, PushRecord, RestPrincipalProvider, StreamSession,
};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const DUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Market-data streamer client.
#[derive(Parser)]
#[command(name = "tds-runner", about = "Market-data streamer client")]
struct Cli {
    /// Configuration file path (JSON).
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Optional log directory for file output. Overrides `module.log_path`.
    #[arg(long)]
    log_dir: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,

    /// Append every received record to this file as a JSON line.
    #[arg(long)]
    dump: Option<PathBuf>,
}

/// Sender half of the dump writer. Records are serialized on the dispatcher
/// task; the file I/O happens on the writer task.
type DumpTx = mpsc::UnboundedSender<String>;

fn principal_provider(source: &PrincipalSource) -> Result<Box<dyn PrincipalProvider>> {
    match source {
        PrincipalSource::File(path) => Ok(Box::new(FilePrincipalProvider::new(path))),
        PrincipalSource::Rest(rest) => {
            let token = std::env::var(&rest.access_token_env)
                .with_context(|| format!("access token env var {} not set", rest.access_token_env))?;
            Ok(Box::new(RestPrincipalProvider::new(&rest.base_url, token)))
        }
    }
}

/// Open `path` for appending and spawn the task that writes dumped lines.
///
/// The task ends, flushing, once every [`DumpTx`] clone is dropped.
async fn spawn_dump_writer(path: &Path) -> Result<(DumpTx, JoinHandle<std::io::Result<u64>>)> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("failed to open dump file {}", path.display()))?;
    let (tx, rx) = mpsc::unbounded_channel();
    Ok((tx, tokio::spawn(write_dump(file, rx))))
}

async fn write_dump(file: File, mut rx: mpsc::UnboundedReceiver<String>) -> std::io::Result<u64> {
    let mut out = BufWriter::new(file);
    let mut lines = 0;
    while let Some(line) = rx.recv().await {
        out.write_all(line.as_bytes()).await?;
        out.write_all(b"\n").await?;
        lines += 1;
    }
    out.flush().await?;
    Ok(lines)
}

fn dump_record(dump: &DumpTx, record: &PushRecord) {
    match serde_json::to_string(record) {
        Ok(line) => {
            if dump.send(line).is_err() {
                warn!("dump writer stopped; dropping {} {}", record.service, record.key);
            }
        }
        Err(e) => warn!("failed to serialize {} {}: {e}", record.service, record.key),
    }
}

async fn subscribe_all(session: &StreamSession, config: &AppConfig, dump: Option<&DumpTx>) {
    for (idx, sub) in config.subscriptions.iter().enumerate() {
        let name = sub.subscriber.clone();
        let dump = dump.cloned();
        let result = session
            .subscribe(sub.service.clone(), &sub.subscriber, &sub.symbols, move |record: &PushRecord| {
                info!("[{name}] {} {} @ {}", record.service, record.key, record.timestamp);
                if let Some(dump) = &dump {
                    dump_record(dump, record);
                }
            })
            .await;
        match result {
            Ok(()) => info!(
                "subscription[{idx}]: {} {} -> {:?}",
                sub.subscriber, sub.service, sub.symbols
            ),
            Err(e) => error!("subscription[{idx}]: {} {}: {e}", sub.subscriber, sub.service),
        }
    }
}

/// Exit status for a session that closed without a Ctrl+C.
fn close_outcome(reason: CloseReason) -> Result<()> {
    match reason {
        CloseReason::Failed(e) => Err(anyhow::Error::from(e).context("session closed unexpectedly")),
        other => {
            info!("session closed ({other:?})");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration
    let config = tds_core::config::load_config(&cli.config)?;

    // 2. Initialize logging
    let module_name = config.module_name();
    let log_dir = cli.log_dir.clone().or_else(|| config.log_path());
    let _log_guard = tds_core::logging::init_logging(&LogOptions {
        level: &cli.log_level,
        dir: log_dir.as_deref(),
        module_name: &module_name,
        format: if cli.log_json { LogFormat::Json } else { LogFormat::Text },
    });
    info!(
        "tds-runner starting: config={}, {} subscription(s)",
        cli.config.display(),
        config.subscriptions.len()
    );

    // 3. Obtain the principal
    let principal = principal_provider(&config.principal)?
        .principal()
        .await
        .context("failed to obtain user principal")?;

    // 4. Log in
    let session = StreamSession::new(Arc::new(principal), config.stream.clone())?;
    session.start().await.context("login failed")?;

    if let Some(level) = config.stream.qos
        && let Err(e) = session.set_qos(level).await
    {
        warn!("qos {level:?} not applied: {e}");
    }

    // 5. Subscribe
    let (dump_tx, dump_writer) = match &cli.dump {
        Some(path) => {
            let (tx, writer) = spawn_dump_writer(path).await?;
            (Some(tx), Some(writer))
        }
        None => (None, None),
    };
    subscribe_all(&session, &config, dump_tx.as_ref()).await;
    drop(dump_tx);
    info!("session ready, press Ctrl+C to stop");

    // 6. Wait for shutdown signal or session loss
    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("shutdown signal received"),
                Err(e) => error!("ctrl_c handler: {e}"),
            }
            if let Err(e) = session.stop().await {
                error!("stop: {e}");
            }
            Ok(())
        }
        reason = session.closed() => close_outcome(reason),
    };

    // 7. Release the subscriber callbacks so the dump writer drains and exits
    drop(session);
    if let Some(writer) = dump_writer {
        match tokio::time::timeout(DUMP_DRAIN_TIMEOUT, writer).await {
            Ok(Ok(Ok(lines))) => info!("dump closed after {lines} record(s)"),
            Ok(Ok(Err(e))) => error!("dump write failed: {e}"),
            Ok(Err(e)) => error!("dump writer task failed: {e}"),
            Err(_) => warn!("dump writer did not finish within {DUMP_DRAIN_TIMEOUT:?}"),
        }
    }

    info!("goodbye");
    outcome
}

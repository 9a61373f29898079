use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use chunkferry_client::{ChunkTransport, Scheduler, SchedulerConfig, UploadEvent, WsTransport};
use chunkferry_protocol::SessionStatus;
use chunkferry_protocol::messages::StatusResponse;
use futures_util::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::cli::{StatusArgs, UploadArgs};

/// How long to wait for the server to hash a finished upload.
const FINALIZE_WAIT: Duration = Duration::from_secs(60);
const FINALIZE_POLL: Duration = Duration::from_millis(250);

pub async fn upload(args: UploadArgs) -> anyhow::Result<()> {
    let transport = Arc::new(
        WsTransport::connect(&args.url)
            .await
            .with_context(|| format!("connecting to {}", args.url))?,
    );
    debug!(url = %args.url, files = args.files.len(), "connected");
    let config = SchedulerConfig {
        concurrency: args.concurrency.max(1),
        max_attempts: args.retries.max(1),
        ..Default::default()
    };

    let uploads = args.files.iter().map(|path| {
        let transport = Arc::clone(&transport) as Arc<dyn ChunkTransport>;
        upload_one(path, transport, config.clone(), args.retry_rounds)
    });
    let results = join_all(uploads).await;
    transport.close().await;

    let mut failed = 0;
    for (path, result) in args.files.iter().zip(results) {
        if let Err(e) = result {
            error!(file = %path.display(), "{e:#}");
            failed += 1;
        }
    }
    if failed > 0 {
        bail!("{failed} of {} uploads failed", args.files.len());
    }
    Ok(())
}

async fn upload_one(
    path: &Path,
    transport: Arc<dyn ChunkTransport>,
    config: SchedulerConfig,
    retry_rounds: u32,
) -> anyhow::Result<()> {
    let name = display_name(path);
    let mut scheduler = Scheduler::new(Arc::clone(&transport), config);
    let printer = scheduler
        .take_events()
        .map(|rx| tokio::spawn(print_events(name.clone(), rx)));

    let session = scheduler.start(path).await?;
    let mut rounds_left = retry_rounds;
    loop {
        tokio::select! {
            _ = scheduler.wait_idle() => {}
            _ = tokio::signal::ctrl_c() => {
                scheduler.cancel();
                bail!("cancelled; run the same command again to resume");
            }
        }

        let snap = scheduler.snapshot();
        if snap.completed {
            break;
        }
        let failed = snap.failed_indices();
        if failed.is_empty() || rounds_left == 0 {
            bail!("{} chunk(s) could not be uploaded: {failed:?}", failed.len());
        }
        rounds_left -= 1;
        warn!(file = %name, chunks = failed.len(), "retrying failed chunks");
        scheduler.retry_failed();
    }
    drop(scheduler);
    if let Some(printer) = printer {
        let _ = printer.await;
    }

    let size = tokio::fs::metadata(path).await?.len();
    let status = wait_for_final_state(transport.as_ref(), &name, size).await?;
    match status.status {
        Some(SessionStatus::Completed) => {
            println!(
                "{name}: complete (session {}, sha256 {})",
                session.session_id,
                status.final_hash.unwrap_or_default()
            );
            Ok(())
        }
        Some(SessionStatus::Failed) => bail!("server failed to finalize the upload"),
        other => bail!("upload not finalized yet (status {other:?})"),
    }
}

/// Polls the session until the server leaves `PROCESSING`.
async fn wait_for_final_state(
    transport: &dyn ChunkTransport,
    filename: &str,
    size: u64,
) -> anyhow::Result<StatusResponse> {
    let deadline = tokio::time::Instant::now() + FINALIZE_WAIT;
    loop {
        let status = transport.status(filename, size).await?;
        let settled = status.status.is_some_and(|s| s.is_terminal());
        if settled || tokio::time::Instant::now() >= deadline {
            return Ok(status);
        }
        tokio::time::sleep(FINALIZE_POLL).await;
    }
}

pub async fn status(args: StatusArgs) -> anyhow::Result<()> {
    let size = tokio::fs::metadata(&args.file)
        .await
        .with_context(|| format!("reading {}", args.file.display()))?
        .len();
    let name = display_name(&args.file);

    let transport = WsTransport::connect(&args.url)
        .await
        .with_context(|| format!("connecting to {}", args.url))?;
    let status = transport.status(&name, size).await?;
    transport.close().await;

    print!("{}", format_status(&name, &status));
    Ok(())
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn format_status(name: &str, status: &StatusResponse) -> String {
    if !status.exists {
        return format!("{name}: no session\n");
    }
    let mut out = format!(
        "{name}: session {}\n  status: {}\n",
        status.session_id.as_deref().unwrap_or("?"),
        status
            .status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".into())
    );
    if let Some(indices) = &status.completed_indices {
        out.push_str(&format!("  chunks stored: {}\n", indices.len()));
    }
    if let Some(hash) = &status.final_hash {
        out.push_str(&format!("  sha256: {hash}\n"));
    }
    out
}

async fn print_events(name: String, mut rx: mpsc::Receiver<UploadEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            UploadEvent::Started {
                total_chunks,
                already_uploaded,
                ..
            } => {
                info!(file = %name, total_chunks, already_uploaded, "upload started");
            }
            UploadEvent::Progress(p) => {
                let eta = p
                    .eta
                    .map(|d| format!("{}s", d.as_secs()))
                    .unwrap_or_else(|| "?".into());
                info!(
                    file = %name,
                    "{:>3}%  {:.1} MiB/s  eta {eta}",
                    p.percent,
                    p.bytes_per_second / (1024.0 * 1024.0)
                );
            }
            UploadEvent::ChunkFailed {
                index,
                attempts,
                error,
            } => {
                warn!(file = %name, index, attempts, "chunk failed: {error}");
            }
            UploadEvent::Cancelled => info!(file = %name, "cancelled"),
            UploadEvent::Completed { .. } => info!(file = %name, "all chunks uploaded"),
            UploadEvent::ChunkStarted { .. } | UploadEvent::Paused | UploadEvent::Resumed => {}
        }
    }
}

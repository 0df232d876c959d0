use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use scrub_preview_core::error::PreviewError;
use scrub_preview_core::ffmpeg::parse_ffmpeg_error;
use scrub_preview_core::sidecar_api::{OpenParams, RetrieveResult, SidecarHost};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::task::JoinHandle;

/// How long pending `preview.retrieve` calls may finish after stdin closes.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct RpcRequest {
    id: u64,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, serde::Serialize)]
struct RpcSuccess {
    id: u64,
    result: Value,
}

#[derive(Debug, serde::Serialize)]
struct RpcFailure {
    id: u64,
    error: RpcErrorPayload,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct RpcErrorPayload {
    summary: String,
    detail: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionParams {
    session_id: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetrieveParams {
    session_id: u64,
    segment_index: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangeSourceParams {
    session_id: u64,
    source_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaybackParams {
    session_id: u64,
    time: f64,
}

type SharedWriter = Arc<Mutex<io::Stdout>>;

fn write_json_line<T: serde::Serialize>(writer: &mut impl Write, value: &T) -> io::Result<()> {
    serde_json::to_writer(&mut *writer, value)
        .map_err(|e| io::Error::other(format!("serialize response: {}", e)))?;
    writer.write_all(b"\n")?;
    writer.flush()
}

fn write_json_line_shared<T: serde::Serialize>(writer: &SharedWriter, value: &T) -> io::Result<()> {
    let mut guard = writer.lock();
    write_json_line(&mut *guard, value)
}

fn parse_error_payload(err: &PreviewError) -> RpcErrorPayload {
    match err {
        PreviewError::FfmpegFailed { code, stderr } => {
            let parsed = parse_ffmpeg_error(stderr, Some(*code));
            RpcErrorPayload {
                summary: parsed.summary,
                detail: parsed.detail,
            }
        }
        _ => {
            let text = err.to_string();
            RpcErrorPayload {
                summary: text.clone(),
                detail: text,
            }
        }
    }
}

fn params_from_value<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, PreviewError> {
    serde_json::from_value(params)
        .map_err(|e| PreviewError::from(format!("Invalid params payload: {}", e)))
}

fn to_value<T: serde::Serialize>(value: T, what: &str) -> Result<Value, PreviewError> {
    serde_json::to_value(value)
        .map_err(|e| PreviewError::from(format!("Failed to serialize {}: {}", what, e)))
}

fn dispatch_sync(host: &SidecarHost, method: &str, params: Value) -> Result<Value, PreviewError> {
    match method {
        "preview.open" => {
            let parsed: OpenParams = params_from_value(params)?;
            to_value(host.open(parsed)?, "open result")
        }
        "preview.highestCached" => {
            let parsed: SessionParams = params_from_value(params)?;
            Ok(json!({ "index": host.highest_cached(parsed.session_id)? }))
        }
        "preview.stats" => {
            let parsed: SessionParams = params_from_value(params)?;
            to_value(host.stats(parsed.session_id)?, "stats")
        }
        "preview.changeSource" => {
            let parsed: ChangeSourceParams = params_from_value(params)?;
            let changed = host.change_source(parsed.session_id, &parsed.source_url)?;
            Ok(json!({ "changed": changed }))
        }
        "playback.timeupdate" => {
            let parsed: PlaybackParams = params_from_value(params)?;
            host.report_time(parsed.session_id, parsed.time)?;
            Ok(json!({ "ok": true }))
        }
        "playback.seeked" => {
            let parsed: PlaybackParams = params_from_value(params)?;
            host.report_seeked(parsed.session_id, parsed.time)?;
            Ok(json!({ "ok": true }))
        }
        "preview.cleanup" => {
            let parsed: SessionParams = params_from_value(params)?;
            Ok(json!({ "closed": host.close(parsed.session_id) }))
        }
        _ => Err(PreviewError::from(format!("Unknown method: {}", method))),
    }
}

fn respond(writer: &SharedWriter, id: u64, result: Result<Value, PreviewError>) {
    let written = match result {
        Ok(result) => write_json_line_shared(writer, &RpcSuccess { id, result }),
        Err(err) => write_json_line_shared(
            writer,
            &RpcFailure {
                id,
                error: parse_error_payload(&err),
            },
        ),
    };
    if let Err(err) = written {
        log::error!(
            target: "scrub_preview::sidecar",
            "failed to write response {}: {}",
            id,
            err
        );
    }
}

fn respond_invalid(writer: &SharedWriter, summary: &str, detail: String) {
    let failure = RpcFailure {
        id: 0,
        error: RpcErrorPayload {
            summary: summary.to_string(),
            detail,
        },
    };
    let _ = write_json_line_shared(writer, &failure);
}

fn handle_retrieve(
    host: &SidecarHost,
    runtime: &tokio::runtime::Runtime,
    request: RpcRequest,
    writer: &SharedWriter,
) -> Option<JoinHandle<()>> {
    let pending = params_from_value::<RetrieveParams>(request.params)
        .and_then(|parsed| host.retrieve(parsed.session_id, parsed.segment_index));
    let pending = match pending {
        Ok(pending) => pending,
        Err(err) => {
            respond(writer, request.id, Err(err));
            return None;
        }
    };
    let writer = Arc::clone(writer);
    let id = request.id;
    Some(runtime.spawn(async move {
        let result: RetrieveResult = pending.await;
        respond(&writer, id, to_value(result, "preview"));
    }))
}

fn main() -> io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("scrub-preview")
        .build()?;
    let host = SidecarHost::new(runtime.handle().clone());
    let stdout: SharedWriter = Arc::new(Mutex::new(io::stdout()));
    let mut pending: Vec<JoinHandle<()>> = Vec::new();

    for line in io::stdin().lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                respond_invalid(&stdout, "Invalid input stream", err.to_string());
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let request: RpcRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                respond_invalid(&stdout, "Invalid request", err.to_string());
                continue;
            }
        };
        log::trace!(
            target: "scrub_preview::sidecar",
            "request {}: {}",
            request.id,
            request.method
        );

        if request.method == "preview.retrieve" {
            pending.retain(|task| !task.is_finished());
            pending.extend(handle_retrieve(&host, &runtime, request, &stdout));
        } else {
            let result = dispatch_sync(&host, &request.method, request.params);
            respond(&stdout, request.id, result);
        }
    }

    let closed = host.close_all();
    log::info!(
        target: "scrub_preview::sidecar",
        "stdin closed; cleaned up {} session(s)",
        closed
    );
    runtime.block_on(async {
        let drain = futures::future::join_all(pending);
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            log::warn!(
                target: "scrub_preview::sidecar",
                "pending previews did not settle within {:?}",
                SHUTDOWN_GRACE
            );
        }
    });
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    Ok(())
}

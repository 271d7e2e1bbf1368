//! Inbound dispatcher: the single reader of the transport.
//!
//! One task per session owns the [`FrameSource`]. For each frame it matches
//! responses to the correlation table, drops heartbeats after logging them,
//! and splits data units into per-symbol records for the registry. A response
//! whose body fails to decode still settles its request, with a decode error.
//! A read failure or end of stream closes the session; the read is never
//! retried. Callbacks run on this task, and a panicking callback is logged
//! without taking the reader down.
//!
//! The task holds only a weak reference to the session, so dropping every
//! [`StreamSession`](crate::session::StreamSession) handle also stops it.

use std::sync::Weak;
use std::time::Duration;

use tds_core::error::TdsError;
use tds_core::time_util::now_ms;
use tds_core::ws::FrameSource;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::correlation::{complete, fail_all};
use crate::proto::decode_frame;
use crate::session::{CloseReason, SessionState, Shared};

/// Expiry settings for in-flight requests.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Expiry {
    pub timeout: Duration,
    pub sweep_interval: Duration,
}

pub(crate) async fn run(
    shared: Weak<Shared>,
    mut state_rx: watch::Receiver<SessionState>,
    mut source: Box<dyn FrameSource>,
    expiry: Option<Expiry>,
) {
    let mut sweep = tokio::time::interval(expiry.map_or(Duration::from_secs(3600), |e| e.sweep_interval));
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut frames: u64 = 0;

    loop {
        if *state_rx.borrow() == SessionState::Closed {
            break;
        }

        tokio::select! {
            changed = state_rx.changed() => {
                if changed.is_err() {
                    debug!("[dispatcher] session dropped");
                    break;
                }
            }

            frame = source.next_text() => {
                let Some(shared) = shared.upgrade() else { break };
                match frame {
                    Some(Ok(text)) => {
                        frames += 1;
                        handle_frame(&shared, &text);
                    }
                    Some(Err(e)) => {
                        error!("[dispatcher] read error: {e}");
                        shared.close(CloseReason::Failed(e));
                        break;
                    }
                    None => {
                        warn!("[dispatcher] stream ended");
                        shared.close(CloseReason::Failed(TdsError::Transport("stream ended by peer".into())));
                        break;
                    }
                }
            }

            _ = sweep.tick(), if expiry.is_some() => {
                if let (Some(shared), Some(expiry)) = (shared.upgrade(), expiry) {
                    expire_stale(&shared, expiry.timeout);
                }
            }
        }
    }

    info!("[dispatcher] stopped after {frames} frame(s)");
}

/// Route every unit of one frame.
pub(crate) fn handle_frame(shared: &Shared, text: &str) {
    let frame = match decode_frame(text) {
        Ok(f) => f,
        Err(e) => {
            warn!("[dispatcher] dropping frame: {e}");
            return;
        }
    };
    if frame.skipped > 0 {
        warn!("[dispatcher] skipped {} malformed unit(s)", frame.skipped);
    }

    for resp in frame.responses {
        let callback = shared.table.lock().take(resp.request_id);
        match callback {
            Some(cb) => {
                debug!(
                    "[dispatcher] ← #{} {}/{} code={}",
                    resp.request_id, resp.service, resp.command, resp.content.code
                );
                complete(resp.request_id, cb, Ok(resp));
            }
            None => debug!(
                "[dispatcher] no pending request #{} for {}/{}",
                resp.request_id, resp.service, resp.command
            ),
        }
    }

    for (id, reason) in frame.malformed_responses {
        let callback = shared.table.lock().take(id);
        match callback {
            Some(cb) => {
                warn!("[dispatcher] ← #{id} invalid response: {reason}");
                complete(id, cb, Err(TdsError::Decode(format!("response #{id}: {reason}"))));
            }
            None => debug!("[dispatcher] no pending request #{id} for invalid response"),
        }
    }

    for hb in frame.heartbeats {
        trace!("[dispatcher] heartbeat {hb} (lag {}ms)", now_ms() - hb.timestamp_millis());
    }

    for unit in frame.data {
        let service = unit.service.clone();
        let (records, skipped) = unit.into_records();
        if skipped > 0 {
            debug!("[dispatcher] {service}: skipped {skipped} record(s) without key");
        }
        for record in &records {
            shared.registry.fanout(record);
        }
    }
}

fn expire_stale(shared: &Shared, timeout: Duration) {
    let expired = shared.table.lock().expire(timeout);
    if expired.is_empty() {
        return;
    }
    warn!("[dispatcher] {} request(s) unanswered after {timeout:?}", expired.len());
    fail_all(expired, |id| TdsError::Timeout { request_id: id });
}

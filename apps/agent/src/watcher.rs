//! VM event source selection.
//!
//! The agent prefers the VM manager's event stream. When the platform
//! does not provide one, it falls back to polling lookups corroborated
//! by the zone-state subprocess and the zone config directory.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use netsync_types::Vm;
use notify::{RecursiveMode, Watcher};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::Agent;
use crate::core::debounce::Debouncer;
use crate::core::zones::ZoneEventStream;

/// Streamed VM changes are coalesced before hitting the reconcilers.
const STREAM_DEBOUNCE: Duration = Duration::from_secs(5);
/// Minimum spacing between two polling lookups.
const MIN_LOOKUP_GAP: Duration = Duration::from_secs(5);
/// How long the probe waits for the stream's ready record.
const PROBE_READY_TIMEOUT: Duration = Duration::from_secs(5);

pub enum WatcherSignal {
    Refresh,
    Stop,
}

#[derive(Debug)]
pub enum WatcherExit {
    Stopped,
    StreamDied,
}

pub enum EventSource {
    Stream(StreamSource),
    Poll,
}

/// A probed, ready event stream: the child, its line reader, and the VM
/// snapshot carried by the ready record.
pub struct StreamSource {
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
    initial: HashMap<Uuid, Vm>,
}

#[derive(Debug, Deserialize)]
struct StreamRecord {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    zonename: Option<String>,
    #[serde(default)]
    vm: Option<Vm>,
    #[serde(default)]
    vms: Option<HashMap<Uuid, Vm>>,
}

/// Probe for the rich event stream by opening it and waiting for the
/// ready record. A platform without the stream gets the polling watcher;
/// a spawn failure is returned so the caller retries.
pub async fn determine_event_source(agent: &Agent) -> Result<EventSource, std::io::Error> {
    let path = &agent.config().vmadm_path;
    let mut child = Command::new(path)
        .args(["events", "-jr"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;

    let stdout = child.stdout.take().expect("stdout was piped");
    let mut lines = BufReader::new(stdout).lines();

    match tokio::time::timeout(PROBE_READY_TIMEOUT, lines.next_line()).await {
        Ok(Ok(Some(line))) => match serde_json::from_str::<StreamRecord>(&line) {
            Ok(record) if record.kind == "ready" => {
                info!(vms = record.vms.as_ref().map_or(0, |v| v.len()), "vm event stream is ready");
                Ok(EventSource::Stream(StreamSource {
                    child,
                    lines,
                    initial: record.vms.unwrap_or_default(),
                }))
            }
            _ => {
                debug!(%line, "event stream spoke something unexpected, falling back to polling");
                let _ = child.start_kill();
                Ok(EventSource::Poll)
            }
        },
        Ok(Ok(None)) | Ok(Err(_)) => {
            info!("vm event stream unavailable, using the polling watcher");
            let _ = child.start_kill();
            Ok(EventSource::Poll)
        }
        Err(_) => {
            info!("vm event stream not ready in time, using the polling watcher");
            let _ = child.start_kill();
            Ok(EventSource::Poll)
        }
    }
}

pub fn start(agent: Agent, source: EventSource) -> (UnboundedSender<WatcherSignal>, JoinHandle<WatcherExit>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = match source {
        EventSource::Stream(stream) => tokio::spawn(stream_watch(agent, stream, rx)),
        EventSource::Poll => tokio::spawn(poll_watch(agent, rx)),
    };
    (tx, task)
}

/// Streaming watcher: a keyed VM cache fed by the event stream, flushed
/// to the reconcilers through a debounced `vms-update`.
async fn stream_watch(
    agent: Agent,
    mut source: StreamSource,
    mut rx: UnboundedReceiver<WatcherSignal>,
) -> WatcherExit {
    let (kick_tx, mut kick_rx) = mpsc::unbounded_channel();
    let mut debounce = Debouncer::new(kick_tx);
    let mut cache = std::mem::take(&mut source.initial);
    debounce.emit_delayed("vms-update", STREAM_DEBOUNCE, ());

    loop {
        tokio::select! {
            line = source.lines.next_line() => match line {
                Ok(Some(line)) => {
                    if apply_stream_line(&mut cache, &line) {
                        debounce.emit_delayed("vms-update", STREAM_DEBOUNCE, ());
                    }
                }
                Ok(None) => {
                    warn!("vm event stream closed");
                    let _ = source.child.start_kill();
                    return WatcherExit::StreamDied;
                }
                Err(err) => {
                    warn!(error = %err, "vm event stream read failed");
                    let _ = source.child.start_kill();
                    return WatcherExit::StreamDied;
                }
            },
            Some(()) = kick_rx.recv() => {
                metrics::counter!("netsync_vm_updates_emitted", 1);
                agent.apply_vms(cache.values().cloned().collect());
            }
            msg = rx.recv() => match msg {
                Some(WatcherSignal::Refresh) => {
                    debounce.emit_delayed("vms-update", STREAM_DEBOUNCE, ());
                }
                Some(WatcherSignal::Stop) | None => {
                    let _ = source.child.start_kill();
                    return WatcherExit::Stopped;
                }
            },
        }
    }
}

/// Fold one stream line into the cache; true when anything changed.
fn apply_stream_line(cache: &mut HashMap<Uuid, Vm>, line: &str) -> bool {
    let line = line.trim();
    if line.is_empty() {
        return false;
    }
    let record: StreamRecord = match serde_json::from_str(line) {
        Ok(record) => record,
        Err(err) => {
            debug!(%line, error = %err, "unparseable event stream line");
            return false;
        }
    };
    match record.kind.as_str() {
        "create" | "modify" => match record.vm {
            Some(vm) => {
                cache.insert(vm.uuid, vm);
                true
            }
            None => false,
        },
        "delete" => record
            .zonename
            .as_deref()
            .and_then(|name| name.parse::<Uuid>().ok())
            .map(|uuid| cache.remove(&uuid).is_some())
            .unwrap_or(false),
        "ready" => match record.vms {
            Some(vms) => {
                *cache = vms;
                true
            }
            None => false,
        },
        other => {
            debug!(kind = other, "ignoring event stream record");
            false
        }
    }
}

/// Polling watcher: lookups triggered by refresh signals, zone state
/// transitions and zone config changes, at least `MIN_LOOKUP_GAP` apart.
/// Signals landing during an in-flight lookup coalesce into exactly one
/// follow-up.
async fn poll_watch(agent: Agent, mut rx: UnboundedReceiver<WatcherSignal>) -> WatcherExit {
    let mut zone_stream = match ZoneEventStream::spawn(&agent.config().zoneevent_path) {
        Ok(stream) => Some(stream),
        Err(err) => {
            warn!(error = %err, "zoneevent unavailable, polling without zone events");
            None
        }
    };

    let (fs_tx, mut fs_rx) = mpsc::unbounded_channel();
    let mut fs_watcher = spawn_dir_watch(&agent.config().zones_dir, fs_tx);

    let mut want = true;
    let mut inflight: Option<JoinHandle<bool>> = None;
    let mut gate_at = Instant::now();

    loop {
        let can_start = want && inflight.is_none();
        tokio::select! {
            _ = sleep_until(gate_at), if can_start => {
                want = false;
                let agent = agent.clone();
                inflight = Some(tokio::spawn(async move { run_lookup(&agent).await }));
            }
            done = async { inflight.as_mut().expect("guarded").await }, if inflight.is_some() => {
                inflight = None;
                gate_at = Instant::now() + MIN_LOOKUP_GAP;
                match done {
                    Ok(true) => {}
                    Ok(false) => want = true,
                    Err(err) => {
                        warn!(error = %err, "lookup task failed");
                        want = true;
                    }
                }
            }
            msg = rx.recv() => match msg {
                Some(WatcherSignal::Refresh) => want = true,
                Some(WatcherSignal::Stop) | None => {
                    if let Some(mut stream) = zone_stream.take() {
                        stream.stop();
                    }
                    if let Some(task) = inflight.take() {
                        task.abort();
                    }
                    return WatcherExit::Stopped;
                }
            },
            event = async { zone_stream.as_mut().expect("guarded").events.recv().await }, if zone_stream.is_some() => {
                match event {
                    Some(event) if event.interesting() => {
                        debug!(zone = %event.zonename, state = %event.newstate, "zone transition");
                        want = true;
                    }
                    Some(_) => {}
                    None => {
                        warn!("zone event stream ended");
                        zone_stream = None;
                    }
                }
            }
            changed = fs_rx.recv(), if fs_watcher.is_some() => {
                match changed {
                    Some(()) => {
                        debug!("zone configuration changed");
                        want = true;
                    }
                    None => fs_watcher = None,
                }
            }
        }
    }
}

async fn run_lookup(agent: &Agent) -> bool {
    metrics::counter!("netsync_vm_lookups", 1);
    match agent.vmadm().lookup().await {
        Ok(vms) => {
            debug!(vms = vms.len(), "vm lookup complete");
            agent.apply_vms(vms);
            true
        }
        Err(err) => {
            warn!(error = %err, "vm lookup failed");
            false
        }
    }
}

/// Watch the zone config directory; XML changes are a corroborating
/// refresh signal. Best-effort: polling works without it.
fn spawn_dir_watch(dir: &str, tx: UnboundedSender<()>) -> Option<notify::RecommendedWatcher> {
    let mut watcher = match notify::recommended_watcher(
        move |res: Result<notify::Event, notify::Error>| {
            if let Ok(event) = res {
                let xml = event
                    .paths
                    .iter()
                    .any(|p| p.extension().map_or(false, |ext| ext == "xml"));
                if xml {
                    let _ = tx.send(());
                }
            }
        },
    ) {
        Ok(watcher) => watcher,
        Err(err) => {
            warn!(error = %err, "cannot create zone config watcher");
            return None;
        }
    };

    if let Err(err) = watcher.watch(Path::new(dir), RecursiveMode::NonRecursive) {
        warn!(dir, error = %err, "cannot watch zone config directory");
        return None;
    }
    Some(watcher)
}

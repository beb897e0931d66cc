//! Background process supervision.
//!
//! A sidecar is a long-running OS process (dev server, watcher, worker)
//! launched on behalf of a conversation. The [`SidecarManager`] hands out
//! monotonically increasing ids that are never reused, pumps stdout and
//! stderr into per-stream tail buffers, and keeps an exited sidecar's
//! buffers around for later inspection.
//!
//! Sidecars are independent of conversation locks and turn cancellation:
//! output is captured whenever it arrives, and a process only stops when
//! [`SidecarManager::terminate`] or [`SidecarManager::shutdown`] asks it to.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long an exited sidecar's readers get to drain their pipes.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// How long a sidecar gets to exit after SIGTERM before it is killed.
const TERM_GRACE: Duration = Duration::from_secs(3);

/// What to launch.
#[derive(Debug, Clone)]
pub struct SidecarSpec {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
}

impl SidecarSpec {
    pub fn new(command: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: HashMap::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    fn display(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }
}

/// Snapshot returned by [`SidecarManager::output`]. Unknown ids are a
/// normal `not_found` answer, not an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SidecarOutput {
    Found {
        id: u64,
        command: String,
        running: bool,
        pid: Option<u32>,
        stdout: String,
        stderr: String,
        exit_code: Option<i32>,
        exited_at: Option<DateTime<Utc>>,
        /// Bytes dropped from the front of either buffer to honour the cap.
        dropped_bytes: u64,
    },
    NotFound { id: u64 },
}

impl SidecarOutput {
    pub fn is_found(&self) -> bool {
        matches!(self, SidecarOutput::Found { .. })
    }
}

// ── Buffers ────────────────────────────────────────────────────────

/// Text buffer that keeps only the newest `cap` bytes.
#[derive(Debug, Default)]
struct TailBuffer {
    text: String,
    cap: Option<usize>,
    dropped: u64,
}

impl TailBuffer {
    fn new(cap: Option<usize>) -> Self {
        Self {
            text: String::new(),
            cap,
            dropped: 0,
        }
    }

    fn push(&mut self, chunk: &str) {
        self.text.push_str(chunk);
        if let Some(cap) = self.cap
            && self.text.len() > cap
        {
            let cut = self.text.ceil_char_boundary(self.text.len() - cap);
            self.text.drain(..cut);
            self.dropped += cut as u64;
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn as_str(self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

// ── Entries ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Lifecycle {
    /// Present while the process is live; taking it is the kill signal.
    kill: Option<oneshot::Sender<()>>,
    pid: Option<u32>,
    exit_code: Option<i32>,
    exited_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Sidecar {
    id: u64,
    command: String,
    stdout: Mutex<TailBuffer>,
    stderr: Mutex<TailBuffer>,
    life: Mutex<Lifecycle>,
    exited: watch::Receiver<bool>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Sidecar {
    fn buffer(&self, stream: Stream) -> &Mutex<TailBuffer> {
        match stream {
            Stream::Stdout => &self.stdout,
            Stream::Stderr => &self.stderr,
        }
    }

    fn snapshot(&self) -> SidecarOutput {
        let life = lock(&self.life);
        let out = lock(&self.stdout);
        let err = lock(&self.stderr);
        SidecarOutput::Found {
            id: self.id,
            command: self.command.clone(),
            running: life.kill.is_some(),
            pid: life.pid,
            stdout: out.text.clone(),
            stderr: err.text.clone(),
            exit_code: life.exit_code,
            exited_at: life.exited_at,
            dropped_bytes: out.dropped + err.dropped,
        }
    }

    /// Send the kill signal if the process is still live.
    fn signal(&self) -> bool {
        match lock(&self.life).kill.take() {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }
}

// ── Manager ────────────────────────────────────────────────────────

pub struct SidecarManager {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, Arc<Sidecar>>>,
    buffer_cap: Option<usize>,
}

impl std::fmt::Debug for SidecarManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SidecarManager")
            .field("tracked", &lock(&self.entries).len())
            .field("buffer_cap", &self.buffer_cap)
            .finish()
    }
}

impl SidecarManager {
    /// `buffer_cap` bounds each stream's buffer in bytes; `None` keeps
    /// everything.
    pub fn new(buffer_cap: Option<usize>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
            buffer_cap,
        }
    }

    /// Spawn a process and start capturing its output. Returns its id.
    pub fn create(&self, spec: SidecarSpec) -> std::io::Result<u64> {
        let mut child = Command::new(&spec.command)
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(false);
        let entry = Arc::new(Sidecar {
            id,
            command: spec.display(),
            stdout: Mutex::new(TailBuffer::new(self.buffer_cap)),
            stderr: Mutex::new(TailBuffer::new(self.buffer_cap)),
            life: Mutex::new(Lifecycle {
                kill: Some(kill_tx),
                pid: child.id(),
                ..Default::default()
            }),
            exited: exit_rx,
        });

        let mut readers = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            readers.push(tokio::spawn(pump(out, Arc::clone(&entry), Stream::Stdout)));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(tokio::spawn(pump(err, Arc::clone(&entry), Stream::Stderr)));
        }
        info!(
            "Sidecar {id} started: {} (pid {:?})",
            entry.command,
            child.id()
        );
        lock(&self.entries).insert(id, Arc::clone(&entry));
        tokio::spawn(supervise(child, kill_rx, exit_tx, readers, entry));
        Ok(id)
    }

    pub fn output(&self, id: u64) -> SidecarOutput {
        match self.get(id) {
            Some(entry) => entry.snapshot(),
            None => SidecarOutput::NotFound { id },
        }
    }

    /// Signal one sidecar, or every tracked one when `id` is `None`.
    /// Returns the ids actually signaled; exited and unknown ids are
    /// skipped silently.
    pub fn terminate(&self, id: Option<u64>) -> Vec<u64> {
        let targets: Vec<Arc<Sidecar>> = match id {
            Some(id) => self.get(id).into_iter().collect(),
            None => lock(&self.entries).values().cloned().collect(),
        };
        let mut signaled: Vec<u64> = targets
            .iter()
            .filter(|e| e.signal())
            .map(|e| e.id)
            .collect();
        signaled.sort_unstable();
        if !signaled.is_empty() {
            info!("Terminating sidecar(s) {signaled:?}");
        }
        signaled
    }

    /// Wait up to `limit` for a sidecar to exit. `false` on timeout or an
    /// unknown id.
    pub async fn wait_exit(&self, id: u64, limit: Duration) -> bool {
        let Some(entry) = self.get(id) else {
            return false;
        };
        let mut rx = entry.exited.clone();
        tokio::time::timeout(limit, rx.wait_for(|done| *done))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    /// Terminate everything and give each process a moment to exit.
    pub async fn shutdown(&self) {
        let ids = self.terminate(None);
        for id in ids {
            if !self.wait_exit(id, Duration::from_secs(5)).await {
                warn!("Sidecar {id} did not exit within 5s of shutdown");
            }
        }
    }

    pub fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = lock(&self.entries).keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn get(&self, id: u64) -> Option<Arc<Sidecar>> {
        lock(&self.entries).get(&id).cloned()
    }
}

async fn pump<R>(mut reader: R, entry: Arc<Sidecar>, stream: Stream)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 8192];
    let mut pending = Vec::new();
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(buf.get(..n).unwrap_or_default());
                let chunk = take_utf8(&mut pending);
                if chunk.is_empty() {
                    continue;
                }
                info!(target: "sidecar", "[{} {}] {}", entry.id, stream.as_str(), chunk.trim_end());
                lock(entry.buffer(stream)).push(&chunk);
            }
            Err(e) => {
                debug!("Sidecar {} {} read failed: {e}", entry.id, stream.as_str());
                break;
            }
        }
    }
    if !pending.is_empty() {
        lock(entry.buffer(stream)).push(&String::from_utf8_lossy(&pending));
    }
}

/// Decode everything in `pending` except a trailing partial character,
/// which stays behind for the next read. Invalid bytes become U+FFFD.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    let mut out = String::new();
    loop {
        let err = match std::str::from_utf8(pending) {
            Ok(text) => {
                out.push_str(text);
                pending.clear();
                return out;
            }
            Err(err) => err,
        };
        let valid: Vec<u8> = pending.drain(..err.valid_up_to()).collect();
        out.push_str(&String::from_utf8_lossy(&valid));
        match err.error_len() {
            None => return out,
            Some(len) => {
                *pending = pending.split_off(len);
                out.push(char::REPLACEMENT_CHARACTER);
            }
        }
    }
}

/// SIGTERM first so the process can clean up, SIGKILL once `TERM_GRACE`
/// runs out.
async fn stop_child(child: &mut Child, id: u64) -> std::io::Result<std::process::ExitStatus> {
    #[cfg(unix)]
    if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) => match tokio::time::timeout(TERM_GRACE, child.wait()).await {
                Ok(status) => return status,
                Err(_) => warn!("Sidecar {id} ignored SIGTERM for {TERM_GRACE:?}, killing"),
            },
            Err(e) => debug!("SIGTERM to sidecar {id} failed: {e}"),
        }
    }
    let _ = child.start_kill();
    child.wait().await
}

/// Wait for exit or a kill request, then record the exit and clear the
/// live handle. Buffers stay.
async fn supervise(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<bool>,
    readers: Vec<JoinHandle<()>>,
    entry: Arc<Sidecar>,
) {
    let natural = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill_rx => None,
    };
    let status = match natural {
        Some(status) => status,
        None => stop_child(&mut child, entry.id).await,
    };
    for reader in readers {
        let _ = tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await;
    }

    let code = status.as_ref().ok().and_then(|s| s.code());
    {
        let mut life = lock(&entry.life);
        life.kill = None;
        life.pid = None;
        life.exit_code = code;
        life.exited_at = Some(Utc::now());
    }
    match status {
        Ok(s) => info!("Sidecar {} exited ({s})", entry.id),
        Err(e) => warn!("Sidecar {} wait failed: {e}", entry.id),
    }
    let _ = exit_tx.send(true);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> SidecarSpec {
        SidecarSpec::new("sh", std::env::temp_dir()).with_args(["-c", script])
    }

    #[tokio::test]
    async fn captures_output_after_exit() {
        let manager = SidecarManager::new(None);
        let id = manager
            .create(sh("echo hello; echo warn >&2; exit 2"))
            .unwrap();
        assert!(manager.wait_exit(id, Duration::from_secs(10)).await);

        let json = serde_json::to_value(manager.output(id)).unwrap();
        assert!(json["exited_at"].is_string(), "{json}");

        match manager.output(id) {
            SidecarOutput::Found {
                running,
                stdout,
                stderr,
                exit_code,
                exited_at,
                ..
            } => {
                assert!(!running);
                assert_eq!(stdout, "hello\n");
                assert_eq!(stderr, "warn\n");
                assert_eq!(exit_code, Some(2));
                assert!(exited_at.is_some());
            }
            SidecarOutput::NotFound { .. } => panic!("sidecar vanished"),
        }
    }

    #[tokio::test]
    async fn ids_increase_and_are_never_reused() {
        let manager = SidecarManager::new(None);
        let a = manager.create(sh("true")).unwrap();
        let b = manager.create(sh("true")).unwrap();
        assert!(b > a);
        manager.wait_exit(a, Duration::from_secs(10)).await;
        let c = manager.create(sh("true")).unwrap();
        assert!(c > b);
        assert_eq!(manager.ids(), vec![a, b, c]);
    }

    #[tokio::test]
    async fn terminate_signals_live_processes_only() {
        let manager = SidecarManager::new(None);
        let done = manager.create(sh("true")).unwrap();
        assert!(manager.wait_exit(done, Duration::from_secs(10)).await);
        let live = manager.create(sh("exec sleep 30")).unwrap();

        assert_eq!(manager.terminate(None), vec![live]);
        assert!(manager.wait_exit(live, Duration::from_secs(10)).await);
        assert!(manager.terminate(Some(live)).is_empty());
        assert!(matches!(
            manager.output(live),
            SidecarOutput::Found { running: false, .. }
        ));
    }

    #[tokio::test]
    async fn unknown_ids_are_not_errors() {
        let manager = SidecarManager::new(None);
        assert!(manager.terminate(Some(42)).is_empty());
        let out = manager.output(42);
        assert_eq!(out, SidecarOutput::NotFound { id: 42 });
        assert_eq!(
            serde_json::to_value(&out).unwrap(),
            serde_json::json!({"status": "not_found", "id": 42})
        );
    }

    #[tokio::test]
    async fn shutdown_stops_everything() {
        let manager = SidecarManager::new(None);
        let a = manager.create(sh("exec sleep 30")).unwrap();
        let b = manager.create(sh("exec sleep 30")).unwrap();
        manager.shutdown().await;
        for id in [a, b] {
            assert!(matches!(
                manager.output(id),
                SidecarOutput::Found { running: false, .. }
            ));
        }
    }

    #[test]
    fn tail_buffer_drops_oldest_bytes() {
        let mut buf = TailBuffer::new(Some(8));
        buf.push("0123456789");
        assert_eq!(buf.text, "23456789");
        assert_eq!(buf.dropped, 2);
        buf.push("ab");
        assert_eq!(buf.text, "456789ab");

        let mut wide = TailBuffer::new(Some(3));
        wide.push("ééé");
        assert_eq!(wide.text, "é");
        assert!(wide.text.len() <= 3);

        let mut open = TailBuffer::new(None);
        open.push(&"x".repeat(10_000));
        assert_eq!(open.text.len(), 10_000);
    }

    fn stdout_of(manager: &SidecarManager, id: u64) -> String {
        match manager.output(id) {
            SidecarOutput::Found { stdout, .. } => stdout,
            SidecarOutput::NotFound { .. } => panic!("sidecar vanished"),
        }
    }

    #[test]
    fn split_characters_wait_for_their_tail() {
        let mut pending = b"a\xC3".to_vec();
        assert_eq!(take_utf8(&mut pending), "a");
        assert_eq!(pending, b"\xC3");

        pending.extend_from_slice(b"\xA9b");
        assert_eq!(take_utf8(&mut pending), "éb");
        assert!(pending.is_empty());

        let mut broken = b"x\xFFy\xE2\x82".to_vec();
        assert_eq!(take_utf8(&mut broken), "x\u{FFFD}y");
        assert_eq!(broken, b"\xE2\x82");
    }

    #[tokio::test]
    async fn output_straddling_reads_keeps_multibyte_characters() {
        let manager = SidecarManager::new(None);
        let id = manager
            .create(sh("head -c 8191 /dev/zero | tr '\\0' a; printf '\\303\\251'"))
            .unwrap();
        assert!(manager.wait_exit(id, Duration::from_secs(10)).await);

        let stdout = stdout_of(&manager, id);
        assert!(!stdout.contains(char::REPLACEMENT_CHARACTER));
        assert!(stdout.ends_with("aé"), "{:?}", stdout.get(stdout.len().saturating_sub(8)..));
        assert_eq!(stdout.chars().count(), 8192);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_lets_the_process_clean_up() {
        let manager = SidecarManager::new(None);
        let id = manager
            .create(sh("trap 'echo bye; exit 0' TERM; echo ready; while true; do sleep 0.1; done"))
            .unwrap();
        let ready = tokio::time::timeout(Duration::from_secs(10), async {
            while !stdout_of(&manager, id).contains("ready") {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(ready.is_ok(), "sidecar never started");

        assert_eq!(manager.terminate(Some(id)), vec![id]);
        assert!(manager.wait_exit(id, Duration::from_secs(10)).await);
        match manager.output(id) {
            SidecarOutput::Found { stdout, exit_code, .. } => {
                assert!(stdout.contains("bye"), "{stdout:?}");
                assert_eq!(exit_code, Some(0));
            }
            SidecarOutput::NotFound { .. } => panic!("sidecar vanished"),
        }
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let manager = SidecarManager::new(None);
        assert!(
            manager
                .create(SidecarSpec::new("no-such-binary-anywhere", std::env::temp_dir()))
                .is_err()
        );
        assert!(manager.ids().is_empty());
    }
}

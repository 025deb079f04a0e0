use crate::error::{PtyHostError, Result};
use parking_lot::{Condvar, Mutex};
use portable_pty::{Child, CommandBuilder, MasterPty, NativePtySystem, PtySize, PtySystem};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};

const CHUNK_SIZE: usize = 64 * 1024;
const RESIZE_DEBOUNCE_MS: u64 = 50;
const KILL_WAIT_MS: u64 = 500;
const MAX_TRANSCRIPT_BYTES: usize = 4 * 1024 * 1024;

/// Receives terminal output and lifecycle notifications from reader threads.
///
/// Implementations are called from blocking threads and must not block for long.
pub trait EventSink: Send + Sync {
    fn emit_chunk(&self, term_id: &str, seq: u64, data: &[u8]);
    fn emit_exit(&self, term_id: &str, exit: &ExitInfo);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub exit_code: Option<u32>,
    pub signal: Option<String>,
}

impl ExitInfo {
    fn from_status(status: &portable_pty::ExitStatus) -> Self {
        Self {
            exit_code: Some(status.exit_code()),
            signal: status.signal().map(str::to_string),
        }
    }

    fn unknown() -> Self {
        Self {
            exit_code: None,
            signal: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalState {
    Created,
    Running,
    Exited,
}

impl TerminalState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TerminalState::Created,
            1 => TerminalState::Running,
            _ => TerminalState::Exited,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            TerminalState::Created => 0,
            TerminalState::Running => 1,
            TerminalState::Exited => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnOptions {
    pub id: String,
    pub cwd: String,
    pub rows: u16,
    pub cols: u16,
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub options: SpawnOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnResponse {
    pub term_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteRequest {
    pub term_id: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResizeRequest {
    pub term_id: String,
    pub rows: u16,
    pub cols: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillRequest {
    pub term_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalSnapshot {
    pub term_id: String,
    pub seq: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalInfo {
    pub term_id: String,
    pub cwd: String,
    pub rows: u16,
    pub cols: u16,
    pub state: TerminalState,
    pub created_at_ms: u64,
    pub last_activity_ms: u64,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

struct TranscriptBuffer {
    buffer: Mutex<Vec<u8>>,
}

impl TranscriptBuffer {
    fn new() -> Self {
        Self {
            buffer: Mutex::new(Vec::new()),
        }
    }

    fn append(&self, bytes: &[u8]) {
        let mut buffer = self.buffer.lock();
        buffer.extend_from_slice(bytes);
        if buffer.len() > MAX_TRANSCRIPT_BYTES {
            let excess = buffer.len() - MAX_TRANSCRIPT_BYTES;
            buffer.drain(..excess);
        }
    }

    fn load_snapshot(&self, limit_bytes: usize) -> Vec<u8> {
        let buffer = self.buffer.lock();
        let start = buffer.len().saturating_sub(limit_bytes);
        buffer[start..].to_vec()
    }
}

type TerminalMap = Arc<Mutex<HashMap<String, Arc<TerminalEntry>>>>;

struct WriteJob {
    data: Vec<u8>,
    done: oneshot::Sender<std::io::Result<()>>,
}

/// Starts the thread that owns the pty writer. Jobs run in the order they were
/// queued; the thread ends once every sender is gone.
fn spawn_writer(
    term_id: &str,
    mut writer: Box<dyn Write + Send>,
) -> Result<mpsc::UnboundedSender<WriteJob>> {
    let (tx, mut rx) = mpsc::unbounded_channel::<WriteJob>();
    std::thread::Builder::new()
        .name(format!("pty-writer-{term_id}"))
        .spawn(move || {
            while let Some(job) = rx.blocking_recv() {
                let result = writer.write_all(&job.data).and_then(|()| writer.flush());
                let _ = job.done.send(result);
            }
        })
        .map_err(|e| PtyHostError::Internal(format!("failed to start writer thread: {e}")))?;
    Ok(tx)
}

struct TerminalEntry {
    term_id: String,
    cwd: String,
    input: mpsc::UnboundedSender<WriteJob>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    child: Mutex<Option<Box<dyn Child + Send + Sync>>>,
    size: Mutex<(u16, u16)>,
    seq: AtomicU64,
    state: AtomicU8,
    created_at_ms: u64,
    last_activity_ms: AtomicU64,
    resizing: AtomicBool,
    closed: AtomicBool,
    exit_reported: AtomicBool,
    gate: Mutex<()>,
    gate_cv: Condvar,
    transcript: TranscriptBuffer,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TerminalEntry {
    fn new(
        term_id: String,
        cwd: String,
        size: (u16, u16),
        master: Box<dyn MasterPty + Send>,
        child: Box<dyn Child + Send + Sync>,
        input: mpsc::UnboundedSender<WriteJob>,
    ) -> Arc<Self> {
        let now = now_millis();
        Arc::new(Self {
            term_id,
            cwd,
            input,
            master: Mutex::new(master),
            child: Mutex::new(Some(child)),
            size: Mutex::new(size),
            seq: AtomicU64::new(0),
            state: AtomicU8::new(TerminalState::Running.as_u8()),
            created_at_ms: now,
            last_activity_ms: AtomicU64::new(now),
            resizing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            exit_reported: AtomicBool::new(false),
            gate: Mutex::new(()),
            gate_cv: Condvar::new(),
            transcript: TranscriptBuffer::new(),
            reader_handle: Mutex::new(None),
        })
    }

    fn wait_for_gate(&self) {
        let mut guard = self.gate.lock();
        while self.resizing.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst) {
            self.gate_cv.wait(&mut guard);
        }
    }

    fn touch(&self) {
        self.last_activity_ms.store(now_millis(), Ordering::SeqCst);
    }

    fn info(&self) -> TerminalInfo {
        let (rows, cols) = *self.size.lock();
        TerminalInfo {
            term_id: self.term_id.clone(),
            cwd: self.cwd.clone(),
            rows,
            cols,
            state: TerminalState::from_u8(self.state.load(Ordering::SeqCst)),
            created_at_ms: self.created_at_ms,
            last_activity_ms: self.last_activity_ms.load(Ordering::SeqCst),
        }
    }

    fn report_exit(&self, sink: &dyn EventSink, exit: ExitInfo) {
        if self.exit_reported.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state
            .store(TerminalState::Exited.as_u8(), Ordering::SeqCst);
        tracing::debug!(
            "terminal {} exited (code={:?}, signal={:?})",
            self.term_id,
            exit.exit_code,
            exit.signal
        );
        sink.emit_exit(&self.term_id, &exit);
    }

    fn spawn_reader(
        self: &Arc<Self>,
        mut reader: Box<dyn Read + Send>,
        sink: Arc<dyn EventSink>,
        terminals: TerminalMap,
    ) {
        let entry = Arc::clone(self);

        let handle = tokio::task::spawn_blocking(move || {
            let mut buffer = vec![0u8; CHUNK_SIZE];
            loop {
                entry.wait_for_gate();

                let read_bytes = match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(err) => {
                        if err.kind() == std::io::ErrorKind::Interrupted {
                            continue;
                        }
                        break;
                    }
                };

                if entry.closed.load(Ordering::SeqCst) {
                    break;
                }

                let chunk = &buffer[..read_bytes];
                let seq = entry.seq.fetch_add(1, Ordering::SeqCst) + 1;
                entry.transcript.append(chunk);
                entry.touch();
                sink.emit_chunk(&entry.term_id, seq, chunk);
            }

            entry.finish(sink.as_ref(), &terminals);
        });

        *self.reader_handle.lock() = Some(handle);
    }

    /// Called once the output stream ends. When `kill` already took the child
    /// it owns exit reporting and this is a no-op.
    fn finish(&self, sink: &dyn EventSink, terminals: &Mutex<HashMap<String, Arc<TerminalEntry>>>) {
        {
            let mut map = terminals.lock();
            let is_current = map
                .get(&self.term_id)
                .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), self));
            if is_current {
                map.remove(&self.term_id);
            }
        }

        let child = self.child.lock().take();
        let Some(mut child) = child else {
            return;
        };

        let exit = match child.wait() {
            Ok(status) => ExitInfo::from_status(&status),
            Err(err) => {
                tracing::warn!("failed to reap terminal process {}: {err}", self.term_id);
                ExitInfo::unknown()
            }
        };
        self.report_exit(sink, exit);
    }

    /// Queues `data` on the writer thread and waits for it to be flushed.
    async fn write(&self, data: Vec<u8>) -> Result<()> {
        let stopped =
            || PtyHostError::Internal(format!("writer for terminal {} has stopped", self.term_id));
        let (done, written) = oneshot::channel();
        self.input
            .send(WriteJob { data, done })
            .map_err(|_| stopped())?;
        written.await.map_err(|_| stopped())??;
        self.touch();
        Ok(())
    }

    async fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        self.resizing.store(true, Ordering::SeqCst);
        self.gate_cv.notify_all();

        let resized = {
            let master = self.master.lock();
            master
                .resize(PtySize {
                    rows,
                    cols,
                    pixel_width: 0,
                    pixel_height: 0,
                })
                .map_err(|e| PtyHostError::Internal(format!("failed to resize pty: {e}")))
        };

        if resized.is_ok() {
            *self.size.lock() = (rows, cols);
            sleep(Duration::from_millis(RESIZE_DEBOUNCE_MS)).await;
        }
        self.resizing.store(false, Ordering::SeqCst);
        self.gate_cv.notify_all();
        resized
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.resizing.store(false, Ordering::SeqCst);
        self.gate_cv.notify_all();
    }
}

/// Owns every live pseudo-terminal and its reader thread.
pub struct PtyHost {
    sink: Arc<dyn EventSink>,
    terminals: TerminalMap,
    creating: Mutex<HashSet<String>>,
}

impl PtyHost {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            terminals: Arc::new(Mutex::new(HashMap::new())),
            creating: Mutex::new(HashSet::new()),
        }
    }

    fn insert_terminal(&self, entry: Arc<TerminalEntry>) {
        self.terminals.lock().insert(entry.term_id.clone(), entry);
    }

    fn get_terminal(&self, term_id: &str) -> Result<Arc<TerminalEntry>> {
        self.terminals
            .lock()
            .get(term_id)
            .cloned()
            .ok_or_else(|| PtyHostError::TerminalNotFound(term_id.to_string()))
    }

    fn remove_terminal(&self, term_id: &str) -> Option<Arc<TerminalEntry>> {
        self.terminals.lock().remove(term_id)
    }

    fn configure_command(opts: &SpawnOptions) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&opts.program);
        for arg in &opts.args {
            cmd.arg(arg);
        }
        cmd.env("LANG", "en_US.UTF-8");
        cmd.env("LC_CTYPE", "en_US.UTF-8");
        cmd.env("TERM", "xterm-256color");
        for key in ["PROMPT_COMMAND", "PS1"] {
            cmd.env_remove(key);
        }
        for (key, value) in &opts.env {
            cmd.env(key, value);
        }
        cmd.cwd(Path::new(&opts.cwd));
        cmd
    }

    fn open_entry(
        opts: &SpawnOptions,
    ) -> Result<(Arc<TerminalEntry>, Box<dyn Read + Send>)> {
        let pty_system = NativePtySystem::default();
        let pair = pty_system
            .openpty(PtySize {
                rows: opts.rows,
                cols: opts.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyHostError::Internal(format!("failed to open pty: {e}")))?;

        let cmd = Self::configure_command(opts);
        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyHostError::Spawn(format!("{}: {e}", opts.program)))?;
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyHostError::Internal(format!("failed to clone reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyHostError::Internal(format!("failed to take writer: {e}")))?;

        let input = spawn_writer(&opts.id, writer)?;

        let entry = TerminalEntry::new(
            opts.id.clone(),
            opts.cwd.clone(),
            (opts.rows, opts.cols),
            pair.master,
            child,
            input,
        );
        Ok((entry, reader))
    }

    pub async fn spawn(&self, request: SpawnRequest) -> Result<SpawnResponse> {
        let opts = request.options;
        {
            let terminals = self.terminals.lock();
            let mut creating = self.creating.lock();
            if terminals.contains_key(&opts.id) || !creating.insert(opts.id.clone()) {
                return Err(PtyHostError::TerminalExists(opts.id));
            }
        }

        // openpty and fork block, so keep them off the async workers
        let id = opts.id.clone();
        let opened = tokio::task::spawn_blocking(move || {
            Self::open_entry(&opts).map(|(entry, reader)| (entry, reader, opts))
        })
        .await
        .map_err(|e| PtyHostError::Internal(format!("terminal spawn task failed: {e}")));
        self.creating.lock().remove(&id);
        let (entry, reader, opts) = opened??;

        self.insert_terminal(Arc::clone(&entry));
        entry.spawn_reader(reader, Arc::clone(&self.sink), Arc::clone(&self.terminals));
        tracing::info!("spawned terminal {} ({}) in {}", opts.id, opts.program, opts.cwd);

        Ok(SpawnResponse { term_id: opts.id })
    }

    pub async fn write(&self, request: WriteRequest) -> Result<()> {
        let entry = self.get_terminal(&request.term_id)?;
        entry.write(request.data).await
    }

    pub async fn resize(&self, request: ResizeRequest) -> Result<()> {
        let entry = self.get_terminal(&request.term_id)?;
        entry.resize(request.rows, request.cols).await
    }

    /// Removes the terminal, kills its process, and reports its exit.
    pub async fn kill(&self, request: KillRequest) -> Result<()> {
        let Some(entry) = self.remove_terminal(&request.term_id) else {
            return Err(PtyHostError::TerminalNotFound(request.term_id));
        };
        entry.close();

        let child = entry.child.lock().take();
        if let Some(mut child) = child {
            if let Err(err) = child.kill() {
                tracing::debug!("failed to kill terminal process {}: {err}", entry.term_id);
            }
            let waited = timeout(
                Duration::from_millis(KILL_WAIT_MS),
                tokio::task::spawn_blocking(move || child.wait()),
            )
            .await;
            let exit = match waited {
                Ok(Ok(Ok(status))) => ExitInfo::from_status(&status),
                _ => {
                    tracing::warn!(
                        "terminal {} did not report an exit status after kill",
                        entry.term_id
                    );
                    ExitInfo::unknown()
                }
            };
            entry.report_exit(self.sink.as_ref(), exit);
        }

        if let Some(handle) = entry.reader_handle.lock().take() {
            handle.abort();
        }
        Ok(())
    }

    /// Kills every terminal without waiting or reporting. Used at shutdown.
    pub fn kill_all(&self) {
        let entries: Vec<_> = self.terminals.lock().drain().map(|(_, e)| e).collect();
        for entry in entries {
            entry.close();
            entry.exit_reported.store(true, Ordering::SeqCst);
            if let Some(mut child) = entry.child.lock().take() {
                if let Err(err) = child.kill() {
                    tracing::debug!("failed to kill terminal process {}: {err}", entry.term_id);
                }
            }
        }
    }

    pub async fn snapshot(&self, term_id: &str) -> Result<TerminalSnapshot> {
        let entry = self.get_terminal(term_id)?;
        let seq = entry.seq.load(Ordering::SeqCst);
        let data = entry.transcript.load_snapshot(MAX_TRANSCRIPT_BYTES);
        Ok(TerminalSnapshot {
            term_id: term_id.to_string(),
            seq,
            data,
        })
    }

    pub fn exists(&self, term_id: &str) -> bool {
        self.terminals.lock().contains_key(term_id)
    }

    pub fn info(&self, term_id: &str) -> Result<TerminalInfo> {
        if let Ok(entry) = self.get_terminal(term_id) {
            return Ok(entry.info());
        }
        if self.creating.lock().contains(term_id) {
            let now = now_millis();
            return Ok(TerminalInfo {
                term_id: term_id.to_string(),
                cwd: String::new(),
                rows: 0,
                cols: 0,
                state: TerminalState::Created,
                created_at_ms: now,
                last_activity_ms: now,
            });
        }
        Err(PtyHostError::TerminalNotFound(term_id.to_string()))
    }

    pub fn list(&self) -> Vec<TerminalInfo> {
        let mut infos: Vec<_> = self.terminals.lock().values().map(|e| e.info()).collect();
        infos.sort_by_key(|info| info.created_at_ms);
        infos
    }
}

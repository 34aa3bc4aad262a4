#![allow(dead_code)]

use async_trait::async_trait;
use snapfs::authority::Authority;
use snapfs::cache::ClientCache;
use snapfs::config::CacheConfig;
use snapfs::fs::FileService;
use snapfs::protocol::{AuthorityRequest, AuthorityResponse, CoherenceClient};
use snapfs::transport::{LocalTransport, Transport, TransportError};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Small chunks so that every non-trivial file needs several transfer calls.
pub const TEST_CHUNK: usize = 16;

pub struct Harness {
    pub tmp: TempDir,
    pub authority: Arc<Authority>,
}

impl Harness {
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("root");
        std::fs::create_dir_all(&root).unwrap();
        let authority = Arc::new(Authority::new(&root, TEST_CHUNK));
        Self { tmp, authority }
    }

    pub fn root(&self) -> PathBuf {
        self.tmp.path().join("root")
    }

    pub fn write_remote(&self, path: &str, data: &[u8]) {
        let p = self.root().join(path);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(p, data).unwrap();
    }

    pub fn read_remote(&self, path: &str) -> Vec<u8> {
        std::fs::read(self.root().join(path)).unwrap()
    }

    pub fn remote_exists(&self, path: &str) -> bool {
        self.root().join(path).exists()
    }

    pub fn cache_dir(&self, name: &str) -> PathBuf {
        self.tmp.path().join(format!("cache-{name}"))
    }

    pub fn scripted(&self) -> Arc<ScriptedTransport> {
        Arc::new(ScriptedTransport::new(self.authority.clone()))
    }

    pub fn cache_with(&self, name: &str, capacity: u64, transport: Arc<dyn Transport>) -> ClientCache {
        let coherence = CoherenceClient::new(transport, Duration::from_secs(5));
        let mut config = CacheConfig::new(self.cache_dir(name), capacity);
        config.eviction_wait_ms = 200;
        ClientCache::new(&config, coherence).unwrap()
    }

    pub fn cache(&self, name: &str, capacity: u64) -> ClientCache {
        let transport = Arc::new(LocalTransport::new(self.authority.clone()));
        self.cache_with(name, capacity, transport)
    }

    pub fn service(&self, name: &str, capacity: u64) -> FileService {
        FileService::new(self.cache(name, capacity), 64)
    }

    pub fn service_with(&self, name: &str, capacity: u64, transport: Arc<dyn Transport>) -> FileService {
        FileService::new(self.cache_with(name, capacity, transport), 64)
    }

    /// Blob files currently present in a client's cache directory.
    pub fn blob_files(&self, name: &str) -> usize {
        std::fs::read_dir(self.cache_dir(name))
            .map(|dir| dir.count())
            .unwrap_or(0)
    }
}

pub async fn read_all(service: &FileService, fd: i32) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let chunk = service.read(fd, 7).await.unwrap();
        if chunk.is_empty() {
            return out;
        }
        out.extend(chunk);
    }
}

pub fn request_kind(request: &AuthorityRequest) -> &'static str {
    match request {
        AuthorityRequest::Check { probe: true, .. } => "Probe",
        AuthorityRequest::Check { .. } => "Check",
        AuthorityRequest::ReadChunk { .. } => "ReadChunk",
        AuthorityRequest::CloseTransfer { .. } => "CloseTransfer",
        AuthorityRequest::BeginCommit { .. } => "BeginCommit",
        AuthorityRequest::WriteChunk { .. } => "WriteChunk",
        AuthorityRequest::FinishCommit { .. } => "FinishCommit",
        AuthorityRequest::Remove { .. } => "Remove",
    }
}

/// In-process transport that records every request and can be told to
/// fail or stall selected calls.
pub struct ScriptedTransport {
    inner: Mutex<LocalTransport>,
    seen: Mutex<Vec<&'static str>>,
    // ReadChunk calls allowed before they start failing
    reads_left: AtomicUsize,
    fail_commits: AtomicBool,
    stall_checks: AtomicBool,
}

impl ScriptedTransport {
    pub fn new(authority: Arc<Authority>) -> Self {
        Self {
            inner: Mutex::new(LocalTransport::new(authority)),
            seen: Mutex::new(Vec::new()),
            reads_left: AtomicUsize::new(usize::MAX),
            fail_commits: AtomicBool::new(false),
            stall_checks: AtomicBool::new(false),
        }
    }

    /// Route all further calls to `authority`, as after a server restart.
    pub fn switch_to(&self, authority: Arc<Authority>) {
        *self.inner.lock().unwrap() = LocalTransport::new(authority);
    }

    pub fn fail_reads_after(&self, n: usize) {
        self.reads_left.store(n, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.reads_left.store(usize::MAX, Ordering::SeqCst);
        self.fail_commits.store(false, Ordering::SeqCst);
        self.stall_checks.store(false, Ordering::SeqCst);
    }

    pub fn fail_commits(&self) {
        self.fail_commits.store(true, Ordering::SeqCst);
    }

    pub fn stall_checks(&self) {
        self.stall_checks.store(true, Ordering::SeqCst);
    }

    pub fn seen(&self) -> Vec<&'static str> {
        self.seen.lock().unwrap().clone()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.seen().iter().filter(|k| **k == kind).count()
    }

    pub fn clear(&self) {
        self.seen.lock().unwrap().clear();
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn call(&self, request: AuthorityRequest) -> Result<AuthorityResponse, TransportError> {
        let kind = request_kind(&request);
        self.seen.lock().unwrap().push(kind);
        match kind {
            "ReadChunk" => {
                let allowed = self
                    .reads_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                        (left > 0).then(|| left.saturating_sub(1))
                    })
                    .is_ok();
                if !allowed {
                    return Err(TransportError::Network("connection reset".into()));
                }
            }
            "BeginCommit" if self.fail_commits.load(Ordering::SeqCst) => {
                return Err(TransportError::Network("connection reset".into()));
            }
            "Check" | "Probe" if self.stall_checks.load(Ordering::SeqCst) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            _ => {}
        }
        let inner = self.inner.lock().unwrap().clone();
        inner.call(request).await
    }
}

//! Resumable transfers for unreliable links.
//!
//! The send stream is cut into fixed-size chunks, each hashed and staged on
//! disk next to a [`TransferManifest`]. The manifest is saved after every
//! change, so an interrupted run can be resumed from the lowest chunk not yet
//! transferred. The chunk set is frozen once `send` has exited successfully;
//! a failed `send` leaves nothing behind for the next run to reuse.
//!
//! A local `receive` only succeeds as a whole, so local destinations always
//! get every chunk again and the per-chunk flags are bookkeeping. Remote
//! destinations get only the pending chunks; a chunk counts as transferred as
//! soon as its bytes are written and goes back to pending if that `receive`
//! fails. The transfer counts as completed only once `receive` exits
//! successfully.

pub mod manifest;
pub mod store;
pub mod transport;

use super::pipeline::RunningStage;
use super::{StageTimeouts, TransferOutcome, TransportStrategy};
use crate::endpoint::{Endpoint, ReceiveOptions, SendEndpoint};
use crate::snapshot::Snapshot;
use crate::utils::errors::{AgentError, Result, SnapshotTransferError};
use manifest::{checksum, ChunkStatus, TransferManifest, TransferStatus};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;
use store::ChunkStore;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};
use transport::{ChunkTransport, ReceiveTransport};

pub use manifest::ChunkMeta;

/// Default chunk size: 64 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024 * 1024;

pub struct ChunkedTransferEngine {
    store: ChunkStore,
    chunk_size: usize,
    timeouts: StageTimeouts,
}

impl ChunkedTransferEngine {
    pub fn new(chunk_dir: impl Into<PathBuf>, chunk_size: usize, timeouts: StageTimeouts) -> Self {
        Self {
            store: ChunkStore::new(chunk_dir),
            chunk_size: chunk_size.max(1),
            timeouts,
        }
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub async fn create_transfer(
        &self,
        snapshot_name: &str,
        destination: &str,
        parent_name: Option<&str>,
    ) -> Result<TransferManifest> {
        let manifest = TransferManifest::new(snapshot_name, destination, parent_name);
        self.store.save(&manifest).await?;
        info!(
            transfer = %manifest.transfer_id,
            snapshot = %snapshot_name,
            destination = %destination,
            "Created chunked transfer"
        );
        Ok(manifest)
    }

    /// Load a transfer that has not completed yet.
    pub async fn resume_transfer(&self, transfer_id: &str) -> Result<TransferManifest> {
        let manifest = self.store.load(transfer_id).await?;
        if manifest.is_completed() {
            return Err(AgentError::Abort(format!("transfer {} is already completed", transfer_id)));
        }
        info!(
            transfer = %transfer_id,
            snapshot = %manifest.snapshot_name,
            transferred = manifest.transferred_count(),
            chunks = manifest.chunk_count,
            resume_point = ?manifest.resume_point(),
            "Resuming chunked transfer"
        );
        Ok(manifest)
    }

    /// The newest unfinished transfer of the same snapshot, destination and parent.
    pub async fn find_resumable(
        &self,
        snapshot_name: &str,
        destination: &str,
        parent_name: Option<&str>,
    ) -> Result<Option<TransferManifest>> {
        Ok(self
            .list_incomplete()
            .await?
            .into_iter()
            .filter(|m| m.describes(snapshot_name, destination, parent_name))
            .last())
    }

    pub async fn list_incomplete(&self) -> Result<Vec<TransferManifest>> {
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|m| !m.is_completed())
            .collect())
    }

    /// Remove the staged data of a transfer.
    pub async fn cleanup(&self, transfer_id: &str) -> Result<()> {
        self.store.remove(transfer_id).await
    }

    /// Record a failure and persist it. Saving is best effort so the original
    /// error is never masked.
    pub async fn fail_transfer(&self, manifest: &mut TransferManifest, reason: &str) {
        warn!(transfer = %manifest.transfer_id, snapshot = %manifest.snapshot_name, "Chunked transfer failed: {}", reason);
        manifest.fail(reason);
        if let Err(e) = self.store.save(manifest).await {
            warn!(transfer = %manifest.transfer_id, "Could not save failed manifest: {}", e);
        }
    }

    pub async fn complete_transfer(&self, manifest: &mut TransferManifest) -> Result<()> {
        manifest.complete();
        self.store.save(manifest).await?;
        info!(
            transfer = %manifest.transfer_id,
            snapshot = %manifest.snapshot_name,
            chunks = manifest.chunk_count,
            bytes = manifest.total_size,
            "Chunked transfer completed"
        );
        Ok(())
    }

    /// Cut `reader` into chunks, staging each one and appending it to the
    /// manifest. The chunk set is frozen when the reader ends.
    pub async fn chunk_stream<R>(&self, manifest: &mut TransferManifest, reader: R) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        if let Err(e) = self.stage_stream(manifest, reader).await {
            self.abandon_chunking(manifest, &format!("chunking failed: {}", e)).await;
            return Err(e);
        }
        self.freeze(manifest).await
    }

    async fn stage_stream<R>(&self, manifest: &mut TransferManifest, mut reader: R) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        manifest.set_status(TransferStatus::Chunking);
        self.store.save(manifest).await?;

        let mut buf = vec![0u8; self.chunk_size];
        loop {
            let mut filled = 0;
            while filled < buf.len() {
                let n = reader.read(&mut buf[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }

            let data = &buf[..filled];
            self.store
                .write_chunk(&manifest.transfer_id, manifest.chunk_count, data)
                .await?;
            let meta = manifest.push_chunk(data);
            self.store.save(manifest).await?;
            debug!(transfer = %manifest.transfer_id, sequence = meta.sequence, size = meta.size, "Staged chunk");

            if filled < buf.len() {
                break;
            }
        }
        Ok(())
    }

    async fn freeze(&self, manifest: &mut TransferManifest) -> Result<()> {
        manifest.freeze_chunks();
        self.save_or_fail(manifest).await
    }

    /// Drop a partial chunk set so the next run chunks from scratch.
    async fn abandon_chunking(&self, manifest: &mut TransferManifest, reason: &str) {
        manifest.reset_chunks();
        self.fail_transfer(manifest, reason).await;
    }

    async fn save_or_fail(&self, manifest: &mut TransferManifest) -> Result<()> {
        if let Err(e) = self.store.save(manifest).await {
            self.fail_transfer(manifest, &format!("could not save manifest: {}", e)).await;
            return Err(e);
        }
        Ok(())
    }

    /// Run `send` and chunk its output. The chunk set is frozen only after
    /// `send` has exited successfully.
    async fn chunk_from_source(
        &self,
        manifest: &mut TransferManifest,
        source: &dyn SendEndpoint,
        snapshot: &Snapshot,
        parent: Option<&Snapshot>,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.timeouts.send;
        let mut stage = match source.send(snapshot, parent, &[]) {
            Ok(process) => RunningStage::new(process),
            Err(e) => {
                self.fail_transfer(manifest, &e.to_string()).await;
                return Err(e);
            }
        };
        let Some(stdout) = stage.take_stdout() else {
            self.fail_transfer(manifest, "send stage has no stdout").await;
            return Err(AgentError::Command("send stage has no stdout".into()));
        };

        let staged = tokio::time::timeout_at(deadline, self.stage_stream(manifest, stdout)).await;
        match staged {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.abandon_chunking(manifest, &format!("chunking failed: {}", e)).await;
                return Err(e);
            }
            Err(_) => {
                self.abandon_chunking(manifest, "timed out while chunking").await;
                return Err(SnapshotTransferError::new(snapshot.name(), "timed out while chunking the send stream").into());
            }
        }

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if let Some(failure) = stage.wait(remaining).await {
            self.abandon_chunking(manifest, &failure.to_string()).await;
            return Err(SnapshotTransferError::new(snapshot.name(), "send failed while chunking")
                .with_stages(vec![failure])
                .into());
        }
        self.freeze(manifest).await
    }

    /// Stream chunks into `transport` in sequence order. With `only_pending`
    /// already transferred chunks are skipped. Returns the bytes written.
    pub async fn send_chunks(
        &self,
        manifest: &mut TransferManifest,
        transport: &mut dyn ChunkTransport,
        only_pending: bool,
    ) -> Result<u64> {
        let mut sent = Vec::new();
        self.send_session(manifest, transport, only_pending, &mut sent).await
    }

    /// [`Self::send_chunks`], recording every sequence written into `sent`.
    async fn send_session(
        &self,
        manifest: &mut TransferManifest,
        transport: &mut dyn ChunkTransport,
        only_pending: bool,
        sent: &mut Vec<u32>,
    ) -> Result<u64> {
        manifest.set_status(TransferStatus::Transferring);
        self.save_or_fail(manifest).await?;

        let chunks = if only_pending {
            manifest.pending_chunks()
        } else {
            let mut all = manifest.chunks.clone();
            all.sort_by_key(|c| c.sequence);
            all
        };

        let mut written = 0u64;
        for chunk in chunks {
            let data = match self.store.read_chunk(&manifest.transfer_id, chunk.sequence).await {
                Ok(data) if chunk.matches(&data) => data,
                Ok(_) => return Err(self.chunk_failed(manifest, chunk.sequence, "staged chunk is corrupt").await),
                Err(e) => return Err(self.chunk_failed(manifest, chunk.sequence, &e.to_string()).await),
            };

            if let Err(e) = transport.write_chunk(&chunk, &data).await {
                return Err(self.chunk_failed(manifest, chunk.sequence, &e.to_string()).await);
            }
            manifest.mark_transferred(chunk.sequence);
            sent.push(chunk.sequence);
            self.save_or_fail(manifest).await?;
            written += data.len() as u64;
        }
        Ok(written)
    }

    async fn chunk_failed(&self, manifest: &mut TransferManifest, sequence: u32, reason: &str) -> AgentError {
        manifest.mark_chunk_failed(sequence, reason);
        self.fail_transfer(manifest, &format!("chunk {}: {}", sequence, reason)).await;
        SnapshotTransferError::new(&manifest.snapshot_name, reason)
            .with_chunk(sequence)
            .into()
    }

    /// Re-hash every staged chunk of a transfer against its manifest.
    pub async fn verify_transfer(&self, transfer_id: &str) -> Result<()> {
        let manifest = self.store.load(transfer_id).await?;
        if !manifest.chunking_complete {
            return Err(AgentError::Verify(format!("transfer {} was never fully chunked", transfer_id)));
        }

        let mut bad = Vec::new();
        for chunk in &manifest.chunks {
            match self.store.read_chunk(transfer_id, chunk.sequence).await {
                Ok(data) if checksum(&data) == chunk.checksum => {}
                _ => bad.push(chunk.sequence),
            }
        }
        if bad.is_empty() {
            Ok(())
        } else {
            Err(AgentError::Verify(format!(
                "transfer {}: chunks {:?} do not match their checksums",
                transfer_id, bad
            )))
        }
    }

    /// Transfer `snapshot` through staged chunks, resuming an earlier attempt
    /// for the same snapshot, destination and parent when there is one.
    pub async fn transfer(
        &self,
        source: &dyn SendEndpoint,
        destination: &dyn Endpoint,
        snapshot: &Snapshot,
        parent: Option<&Snapshot>,
    ) -> Result<TransferOutcome> {
        let start = Instant::now();
        let destination_id = destination.id();
        let parent_name = parent.map(|p| p.name());

        let mut manifest = match self
            .find_resumable(&snapshot.name(), &destination_id, parent_name.as_deref())
            .await?
        {
            Some(found) => self.resume_transfer(&found.transfer_id).await?,
            None => {
                self.create_transfer(&snapshot.name(), &destination_id, parent_name.as_deref())
                    .await?
            }
        };

        if !manifest.chunking_complete {
            manifest.reset_chunks();
            self.chunk_from_source(&mut manifest, source, snapshot, parent).await?;
        }

        let only_pending = destination.is_remote();
        if !only_pending && manifest.chunks.iter().any(|c| c.status != ChunkStatus::Pending) {
            debug!(transfer = %manifest.transfer_id, "Local receive restarts from the first chunk");
        }

        let process = match destination.receive(Stdio::piped(), &ReceiveOptions::default()) {
            Ok(process) => process,
            Err(e) => {
                self.fail_transfer(&mut manifest, &e.to_string()).await;
                return Err(e);
            }
        };
        let mut transport = match ReceiveTransport::new(&snapshot.name(), process, self.timeouts.receive) {
            Ok(transport) => transport,
            Err(e) => {
                self.fail_transfer(&mut manifest, &e.to_string()).await;
                return Err(e);
            }
        };

        // A receive that exits non-zero keeps nothing it was given.
        let mut sent = Vec::new();
        let result = self
            .send_session(&mut manifest, &mut transport, only_pending, &mut sent)
            .await;
        let session = match result {
            Ok(_) if sent.is_empty() => {
                let all: Vec<u32> = manifest.chunks.iter().map(|c| c.sequence).collect();
                manifest.reopen_chunks(&all);
                Err(SnapshotTransferError::new(snapshot.name(), "receive was given no chunks").into())
            }
            Ok(_) => transport.finish().await,
            Err(e) => Err(e),
        };
        if let Err(e) = session {
            manifest.reopen_chunks(&sent);
            self.fail_transfer(&mut manifest, &e.to_string()).await;
            return Err(e);
        }

        if let Err(e) = self.complete_transfer(&mut manifest).await {
            warn!(transfer = %manifest.transfer_id, "Could not record completed transfer: {}", e);
        }
        if let Err(e) = self.cleanup(&manifest.transfer_id).await {
            warn!(transfer = %manifest.transfer_id, "Could not remove staged chunks: {}", e);
        }

        Ok(TransferOutcome {
            bytes: Some(manifest.total_size),
            duration: start.elapsed(),
            strategy: TransportStrategy::Chunked,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::transport::test_support::MemoryTransport;
    use super::*;
    use crate::endpoint::test_support::{fake_btrfs, make_snapshot};
    use crate::endpoint::{LocalEndpoint, ShellEndpoint, SpaceInfo, SpawnedProcess};
    use crate::locks::LockTable;
    use crate::snapshot::test_support::snap;
    use async_trait::async_trait;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use tempfile::TempDir;

    /// A shell destination that reports itself as remote, so only pending
    /// chunks are sent to it.
    struct RemoteShell(ShellEndpoint);

    #[async_trait]
    impl Endpoint for RemoteShell {
        fn id(&self) -> String {
            self.0.id()
        }
        fn prefix(&self) -> &str {
            self.0.prefix()
        }
        fn is_remote(&self) -> bool {
            true
        }
        async fn prepare(&self) -> Result<()> {
            self.0.prepare().await
        }
        fn receive(&self, stdin: Stdio, options: &ReceiveOptions) -> Result<SpawnedProcess> {
            self.0.receive(stdin, options)
        }
        async fn list_snapshots(&self, flush_cache: bool) -> Result<Vec<Snapshot>> {
            self.0.list_snapshots(flush_cache).await
        }
        async fn register_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
            self.0.register_snapshot(snapshot).await
        }
        async fn lock_table(&self) -> Result<LockTable> {
            self.0.lock_table().await
        }
        async fn set_lock(&self, snapshot: &Snapshot, lock_id: &str, active: bool, parent: bool) -> Result<()> {
            self.0.set_lock(snapshot, lock_id, active, parent).await
        }
        async fn clear_locks(&self, lock_id: &str) -> Result<Vec<String>> {
            self.0.clear_locks(lock_id).await
        }
        async fn delete_snapshots(&self, snapshots: &[Snapshot]) -> Result<Vec<Snapshot>> {
            self.0.delete_snapshots(snapshots).await
        }
        async fn get_space_info(&self) -> Result<SpaceInfo> {
            self.0.get_space_info().await
        }
    }

    /// Destination command that fails its first run and stores the stream in
    /// `out` afterwards.
    fn fails_once(dir: &Path, out: &Path) -> String {
        format!(
            "if [ -f {flag} ]; then cat > {out}; else touch {flag}; cat > /dev/null; exit 1; fi",
            flag = dir.join("receive-flag").display(),
            out = out.display()
        )
    }

    fn engine(dir: &TempDir, chunk_size: usize) -> ChunkedTransferEngine {
        ChunkedTransferEngine::new(dir.path().join("chunks"), chunk_size, StageTimeouts::default())
    }

    fn stream(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_chunking_splits_and_freezes() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, 10);
        let data = stream(95);

        let mut m = engine.create_transfer("h-1", "dest", None).await.unwrap();
        engine.chunk_stream(&mut m, &data[..]).await.unwrap();

        assert_eq!(m.chunk_count, 10);
        assert_eq!(m.total_size, 95);
        assert_eq!(m.chunks.last().unwrap().size, 5);
        assert!(m.chunking_complete);
        assert_eq!(m.status, TransferStatus::Chunking);

        let stored = engine.store().load(&m.transfer_id).await.unwrap();
        assert_eq!(stored.chunk_count, 10);
        engine.verify_transfer(&m.transfer_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_exact_multiple_has_no_empty_chunk() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, 10);
        let mut m = engine.create_transfer("h-1", "dest", None).await.unwrap();
        engine.chunk_stream(&mut m, &stream(30)[..]).await.unwrap();
        assert_eq!(m.chunk_count, 3);
        assert!(m.chunks.iter().all(|c| c.size == 10));
    }

    #[tokio::test]
    async fn test_interrupted_transfer_resumes_at_first_pending_chunk() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, 10);
        let data = stream(100);

        let mut m = engine.create_transfer("h-1", "ssh://nas/b", None).await.unwrap();
        engine.chunk_stream(&mut m, &data[..]).await.unwrap();

        // The link drops while chunk 6 is being written.
        let mut first = MemoryTransport::failing_on(6);
        let err = engine.send_chunks(&mut m, &mut first, true).await.unwrap_err();
        match err {
            AgentError::SnapshotTransfer(e) => assert_eq!(e.chunk, Some(6)),
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(first.sequences, vec![0, 1, 2, 3, 4, 5]);

        let mut resumed = engine.resume_transfer(&m.transfer_id).await.unwrap();
        assert_eq!(resumed.status, TransferStatus::Failed);
        assert_eq!(resumed.resume_point(), Some(6));

        let mut second = MemoryTransport::default();
        engine.send_chunks(&mut resumed, &mut second, true).await.unwrap();
        assert_eq!(second.sequences, vec![6, 7, 8, 9]);

        let mut reassembled = first.data.clone();
        reassembled.extend_from_slice(&second.data);
        assert_eq!(reassembled, data);

        engine.complete_transfer(&mut resumed).await.unwrap();
        assert!(engine.list_incomplete().await.unwrap().is_empty());
        assert!(engine.resume_transfer(&m.transfer_id).await.is_err());
    }

    #[tokio::test]
    async fn test_local_mode_resends_everything() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, 4);
        let data = stream(20);
        let mut m = engine.create_transfer("h-1", "local", None).await.unwrap();
        engine.chunk_stream(&mut m, &data[..]).await.unwrap();
        m.mark_transferred(0);
        m.mark_transferred(1);

        let mut transport = MemoryTransport::default();
        engine.send_chunks(&mut m, &mut transport, false).await.unwrap();
        assert_eq!(transport.sequences, vec![0, 1, 2, 3, 4]);
        assert_eq!(transport.data, data);
    }

    #[tokio::test]
    async fn test_verify_detects_corruption() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, 8);
        let mut m = engine.create_transfer("h-1", "dest", None).await.unwrap();
        engine.chunk_stream(&mut m, &stream(32)[..]).await.unwrap();

        engine.store().write_chunk(&m.transfer_id, 2, b"tampered").await.unwrap();
        let err = engine.verify_transfer(&m.transfer_id).await.unwrap_err();
        assert!(matches!(err, AgentError::Verify(ref msg) if msg.contains("[2]")));

        // Sending refuses the corrupt chunk and records it.
        let mut transport = MemoryTransport::default();
        assert!(engine.send_chunks(&mut m, &mut transport, true).await.is_err());
        assert_eq!(transport.sequences, vec![0, 1]);
        assert_eq!(m.chunk(2).unwrap().status, ChunkStatus::Failed);
    }

    #[tokio::test]
    async fn test_end_to_end_local_transfer() {
        let dir = TempDir::new().unwrap();
        let btrfs = fake_btrfs(dir.path()).to_string_lossy().into_owned();
        let source = LocalEndpoint::new(dir.path().join("src"), "h-").with_btrfs_command(&btrfs);
        let dest = LocalEndpoint::new(dir.path().join("dst"), "h-").with_btrfs_command(&btrfs);
        dest.prepare().await.unwrap();
        let s = snap("h-", 1);
        let payload = stream(1000);
        make_snapshot(source.dir(), &s.name(), &payload);

        let engine = engine(&dir, 64);
        let outcome = engine.transfer(&source, &dest, &s, None).await.unwrap();

        assert_eq!(outcome.strategy, TransportStrategy::Chunked);
        assert_eq!(outcome.bytes, Some((s.name().len() + 1 + 1000) as u64));
        let received = std::fs::read(dest.dir().join(s.name()).join("data")).unwrap();
        assert_eq!(received, payload);
        assert!(engine.list_incomplete().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_transfer_is_resumed_by_next_run() {
        let dir = TempDir::new().unwrap();
        let btrfs = fake_btrfs(dir.path()).to_string_lossy().into_owned();
        let source = LocalEndpoint::new(dir.path().join("src"), "h-").with_btrfs_command(&btrfs);
        let s = snap("h-", 1);
        make_snapshot(source.dir(), &s.name(), b"resumable payload");

        let out = dir.path().join("out");
        let dest = ShellEndpoint::new(fails_once(dir.path(), &out), "h-");

        let engine = engine(&dir, 5);
        assert!(engine.transfer(&source, &dest, &s, None).await.is_err());
        let pending = engine.list_incomplete().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, TransferStatus::Failed);
        assert!(pending[0].chunking_complete);

        engine.transfer(&source, &dest, &s, None).await.unwrap();
        let expected = format!("{}\nresumable payload", s.name());
        assert_eq!(std::fs::read_to_string(&out).unwrap(), expected);
        assert!(engine.list_incomplete().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_receive_puts_chunks_back_to_pending() {
        let dir = TempDir::new().unwrap();
        let btrfs = fake_btrfs(dir.path()).to_string_lossy().into_owned();
        let source = LocalEndpoint::new(dir.path().join("src"), "h-").with_btrfs_command(&btrfs);
        let s = snap("h-", 1);
        let payload = stream(30);
        make_snapshot(source.dir(), &s.name(), &payload);

        let out = dir.path().join("out");
        let dest = RemoteShell(ShellEndpoint::new(fails_once(dir.path(), &out), "h-"));

        let engine = engine(&dir, 5);
        assert!(engine.transfer(&source, &dest, &s, None).await.is_err());
        let pending = engine.list_incomplete().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, TransferStatus::Failed);
        assert_eq!(pending[0].transferred_count(), 0);
        assert_eq!(pending[0].resume_point(), Some(0));

        engine.transfer(&source, &dest, &s, None).await.unwrap();
        let mut expected = format!("{}\n", s.name()).into_bytes();
        expected.extend_from_slice(&payload);
        assert_eq!(std::fs::read(&out).unwrap(), expected);
        assert!(engine.list_incomplete().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_receive_given_no_chunks_is_not_completed() {
        let dir = TempDir::new().unwrap();
        let btrfs = fake_btrfs(dir.path()).to_string_lossy().into_owned();
        let source = LocalEndpoint::new(dir.path().join("src"), "h-").with_btrfs_command(&btrfs);
        let s = snap("h-", 1);
        make_snapshot(source.dir(), &s.name(), b"payload");
        let dest = RemoteShell(ShellEndpoint::new("cat > /dev/null", "h-"));
        let engine = engine(&dir, 4);

        // Every chunk is already marked as transferred, e.g. after a crash.
        let mut m = engine.create_transfer(&s.name(), &dest.id(), None).await.unwrap();
        let data = format!("{}\npayload", s.name()).into_bytes();
        engine.chunk_stream(&mut m, &data[..]).await.unwrap();
        for seq in 0..m.chunk_count {
            m.mark_transferred(seq);
        }
        engine.store().save(&m).await.unwrap();

        let err = engine.transfer(&source, &dest, &s, None).await.unwrap_err();
        assert!(err.is_transfer_failure());
        let stored = engine.store().load(&m.transfer_id).await.unwrap();
        assert_eq!(stored.status, TransferStatus::Failed);
        assert_eq!(stored.transferred_count(), 0);

        engine.transfer(&source, &dest, &s, None).await.unwrap();
        assert!(engine.list_incomplete().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_send_failing_midway_is_chunked_again() {
        let dir = TempDir::new().unwrap();
        let btrfs = fake_btrfs(dir.path());
        // Emits a truncated stream and fails on the first send only.
        let wrapper = dir.path().join("flaky-btrfs");
        std::fs::write(
            &wrapper,
            format!(
                "#!/bin/sh\nif [ \"$1\" = send ] && [ ! -f {flag} ]; then touch {flag}; printf HALF; exit 1; fi\nexec {real} \"$@\"\n",
                flag = dir.path().join("send-flag").display(),
                real = btrfs.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&wrapper, std::fs::Permissions::from_mode(0o755)).unwrap();

        let source =
            LocalEndpoint::new(dir.path().join("src"), "h-").with_btrfs_command(wrapper.to_string_lossy().into_owned());
        let s = snap("h-", 1);
        make_snapshot(source.dir(), &s.name(), b"complete payload");
        let out = dir.path().join("out");
        let dest = ShellEndpoint::new(format!("cat > {}", out.display()), "h-");

        let engine = engine(&dir, 8);
        assert!(engine.transfer(&source, &dest, &s, None).await.is_err());
        let pending = engine.list_incomplete().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, TransferStatus::Failed);
        assert!(!pending[0].chunking_complete);
        assert_eq!(pending[0].chunk_count, 0);
        assert!(!out.exists());

        engine.transfer(&source, &dest, &s, None).await.unwrap();
        let expected = format!("{}\ncomplete payload", s.name());
        assert_eq!(std::fs::read_to_string(&out).unwrap(), expected);
    }

    #[tokio::test]
    async fn test_send_that_cannot_start_is_recorded() {
        let dir = TempDir::new().unwrap();
        let source = LocalEndpoint::new(dir.path().join("src"), "h-")
            .with_btrfs_command(dir.path().join("missing-btrfs").to_string_lossy().into_owned());
        let s = snap("h-", 1);
        make_snapshot(source.dir(), &s.name(), b"x");
        let dest = ShellEndpoint::new("cat > /dev/null", "h-");

        let engine = engine(&dir, 8);
        assert!(engine.transfer(&source, &dest, &s, None).await.is_err());
        let pending = engine.list_incomplete().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, TransferStatus::Failed);
        assert!(pending[0].error_message.is_some());
    }
}

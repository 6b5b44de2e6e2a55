//! 上传流水线：接收任务读取请求体，经有界通道交给写盘任务，最后核对字节数。
//!
//! The receiver runs on the connection task and never touches the disk; the
//! writer runs on the blocking pool and never touches the network. They only
//! share the channel and a single-slot result handoff.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::{COALESCE_THRESHOLD, PIPELINE_DEPTH, READ_BLOCK_SIZE};
use crate::error::UploadError;
use crate::locking::BusyGuard;
use crate::storage::UploadPaths;
use crate::wal::JournaledFile;

/// What one pipeline run achieved.
#[derive(Debug)]
pub struct PipelineReport {
    pub received: u64,
    pub committed: u64,
    pub result: Result<(), UploadError>,
}

enum ReceiverEnd {
    Eof,
    WriterGone,
    Failed(UploadError),
}

struct WriterOutcome {
    committed: u64,
    error: Option<UploadError>,
}

/// Streams `body` into the journaled data file of `paths`, starting at
/// `start_offset` and expecting exactly `count` bytes.
///
/// The journal must already exist. Success requires a clean end of body, no
/// writer error and `count` committed bytes; every other outcome is
/// retryable from the offset a new admission check reports.
///
/// The writer owns a clone of `hold` until its files are closed, so the key
/// stays busy even if this future is dropped mid-transfer.
pub async fn run_pipeline<R>(
    body: R,
    paths: &UploadPaths,
    hold: BusyGuard,
    start_offset: u64,
    count: u64,
    durable: bool,
) -> PipelineReport
where
    R: AsyncRead + Unpin,
{
    let (block_tx, block_rx) = mpsc::channel::<Vec<u8>>(PIPELINE_DEPTH);
    let (result_tx, result_rx) = oneshot::channel();

    let writer_paths = paths.clone();
    tokio::task::spawn_blocking(move || {
        let outcome = write_blocks(&writer_paths, start_offset, durable, block_rx);
        // The supervisor only goes away when the whole request is dropped.
        let _ = result_tx.send(outcome);
        drop(hold);
    });

    let (received, receiver_end) = receive(body, block_tx, count).await;
    let outcome = result_rx.await.unwrap_or_else(|_| WriterOutcome {
        committed: 0,
        error: Some(UploadError::Write(io::Error::other(
            "writer ended without reporting",
        ))),
    });

    let result = match (receiver_end, outcome.error) {
        (ReceiverEnd::Failed(err), _) => Err(err),
        (_, Some(err)) => Err(err),
        (ReceiverEnd::WriterGone, None) => Err(UploadError::Write(io::Error::other(
            "writer stopped before the body ended",
        ))),
        (ReceiverEnd::Eof, None) if outcome.committed != count => Err(UploadError::ShortWrite {
            expected: count,
            committed: outcome.committed,
        }),
        (ReceiverEnd::Eof, None) => Ok(()),
    };

    match &result {
        Ok(()) => debug!(
            key = paths.key,
            start_offset,
            committed = outcome.committed,
            "pipeline finished"
        ),
        Err(err) => warn!(
            key = paths.key,
            start_offset,
            received,
            committed = outcome.committed,
            error = %err,
            "pipeline failed"
        ),
    }

    PipelineReport {
        received,
        committed: outcome.committed,
        result,
    }
}

async fn receive<R>(mut body: R, blocks: mpsc::Sender<Vec<u8>>, limit: u64) -> (u64, ReceiverEnd)
where
    R: AsyncRead + Unpin,
{
    let mut received = 0u64;
    loop {
        let mut block = vec![0u8; READ_BLOCK_SIZE];
        let read = match body.read(&mut block).await {
            Ok(0) => return (received, ReceiverEnd::Eof),
            Ok(read) => read,
            Err(err) => return (received, ReceiverEnd::Failed(UploadError::ConnectionRead(err))),
        };
        block.truncate(read);

        let room = limit - received;
        let too_long = read as u64 > room;
        if too_long {
            block.truncate(room as usize);
        }
        received += block.len() as u64;
        if !block.is_empty() && blocks.send(block).await.is_err() {
            return (received, ReceiverEnd::WriterGone);
        }
        if too_long {
            return (received, ReceiverEnd::Failed(UploadError::BodyTooLong));
        }
    }
}

fn write_blocks(
    paths: &UploadPaths,
    start_offset: u64,
    durable: bool,
    mut blocks: mpsc::Receiver<Vec<u8>>,
) -> WriterOutcome {
    let mut file = match JournaledFile::open(paths, start_offset, durable) {
        Ok(file) => file,
        Err(err) => {
            return WriterOutcome {
                committed: 0,
                error: Some(UploadError::Write(err)),
            };
        }
    };

    let mut committed = 0u64;
    let mut error = None;
    let mut pending: Vec<u8> = Vec::with_capacity(COALESCE_THRESHOLD);
    let mut flush = |file: &mut JournaledFile, bytes: &[u8]| -> io::Result<()> {
        let (written, result) = file.append(bytes);
        committed += written;
        result
    };

    while let Some(block) = blocks.blocking_recv() {
        if block.is_empty() {
            continue;
        }
        let result = if block.len() >= COALESCE_THRESHOLD {
            let flushed = if pending.is_empty() {
                Ok(())
            } else {
                flush(&mut file, &pending)
            };
            pending.clear();
            flushed.and_then(|_| flush(&mut file, &block))
        } else {
            pending.extend_from_slice(&block);
            if pending.len() >= COALESCE_THRESHOLD {
                let flushed = flush(&mut file, &pending);
                pending.clear();
                flushed
            } else {
                Ok(())
            }
        };
        if let Err(err) = result {
            error = Some(UploadError::Write(err));
            break;
        }
    }
    // Unblocks a receiver waiting on a full channel.
    drop(blocks);

    if error.is_none()
        && !pending.is_empty()
        && let Err(err) = flush(&mut file, &pending)
    {
        error = Some(UploadError::Write(err));
    }
    if let Err(err) = file.close()
        && error.is_none()
    {
        error = Some(UploadError::Close(err));
    }

    WriterOutcome { committed, error }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::admit_upload;
    use crate::config::HUNK_SIZE;
    use crate::journal::{Header, recover};
    use crate::locking::BusyRegistry;
    use crate::wal::create_journal;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tempfile::tempdir;
    use tokio::io::ReadBuf;

    fn fresh_upload(dir: &std::path::Path, len: u64) -> UploadPaths {
        let paths = UploadPaths::new("up.bin".into(), dir.join("up.bin"));
        create_journal(
            &paths,
            &Header {
                expected_length: len,
                content_hash: None,
            },
        )
        .expect("create journal");
        paths
    }

    fn hold() -> BusyGuard {
        BusyRegistry::new().try_acquire("up.bin").expect("acquire")
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 256) as u8).collect()
    }

    /// Hands out the body in blocks of varying size, optionally failing at
    /// the end instead of reporting EOF.
    struct Chunked {
        data: Vec<u8>,
        pos: usize,
        sizes: Vec<usize>,
        turn: usize,
        fail_at_end: bool,
    }

    impl AsyncRead for Chunked {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let this = &mut *self;
            if this.pos == this.data.len() {
                if this.fail_at_end {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        "client went away",
                    )));
                }
                return Poll::Ready(Ok(()));
            }
            let size = this.sizes[this.turn % this.sizes.len()];
            this.turn += 1;
            let len = size
                .min(buf.remaining())
                .min(this.data.len() - this.pos)
                .max(1);
            buf.put_slice(&this.data[this.pos..this.pos + len]);
            this.pos += len;
            Poll::Ready(Ok(()))
        }
    }

    fn chunked(data: Vec<u8>, sizes: &[usize]) -> Chunked {
        Chunked {
            data,
            pos: 0,
            sizes: sizes.to_vec(),
            turn: 0,
            fail_at_end: false,
        }
    }

    #[tokio::test]
    async fn bytes_are_conserved_across_many_small_blocks() {
        let temp = tempdir().expect("tempdir");
        let len = HUNK_SIZE + COALESCE_THRESHOLD + 123;
        let paths = fresh_upload(temp.path(), len as u64);
        let data = payload(len);

        let body = chunked(data.clone(), &[1, 7, 300, 4096, READ_BLOCK_SIZE, 17]);
        let report = run_pipeline(body, &paths, hold(), 0, len as u64, false).await;
        report.result.expect("pipeline");
        assert_eq!(report.received, len as u64);
        assert_eq!(report.committed, len as u64);

        assert_eq!(std::fs::read(&paths.partial_path).expect("read"), data);
        let journal = std::fs::File::open(&paths.journal_path).expect("journal");
        let recovery = recover(std::io::BufReader::new(journal));
        assert!(recovery.error.is_none());
        assert_eq!(recovery.state.start_offset, len as u64);
    }

    #[tokio::test]
    async fn resumed_pipeline_appends_at_offset() {
        let temp = tempdir().expect("tempdir");
        let data = payload(5000);
        let paths = fresh_upload(temp.path(), 5000);

        let first = run_pipeline(&data[..2000], &paths, hold(), 0, 2000, false).await;
        first.result.expect("first part");
        let state = admit_upload(&paths).into_result().expect("admitted");
        assert_eq!(state.start_offset, 2000);

        let second = run_pipeline(&data[2000..], &paths, hold(), 2000, 3000, true).await;
        second.result.expect("second part");
        assert_eq!(std::fs::read(&paths.partial_path).expect("read"), data);
    }

    #[tokio::test]
    async fn short_body_is_reported_as_short_write() {
        let temp = tempdir().expect("tempdir");
        let paths = fresh_upload(temp.path(), 100);
        let data = payload(60);

        let report = run_pipeline(&data[..], &paths, hold(), 0, 100, false).await;
        assert_eq!(report.committed, 60);
        match report.result {
            Err(err @ UploadError::ShortWrite { .. }) => assert!(err.is_retryable()),
            other => panic!("unexpected result: {other:?}"),
        }
        let state = admit_upload(&paths).into_result().expect("admitted");
        assert_eq!(state.start_offset, 60);
    }

    #[tokio::test]
    async fn connection_error_keeps_committed_bytes() {
        let temp = tempdir().expect("tempdir");
        let paths = fresh_upload(temp.path(), 1000);
        let mut body = chunked(payload(400), &[100]);
        body.fail_at_end = true;

        let report = run_pipeline(body, &paths, hold(), 0, 1000, false).await;
        assert!(matches!(report.result, Err(UploadError::ConnectionRead(_))));
        assert_eq!(report.committed, 400);
        let state = admit_upload(&paths).into_result().expect("admitted");
        assert_eq!(state.start_offset, 400);
    }

    #[tokio::test]
    async fn body_longer_than_announced_is_cut_off() {
        let temp = tempdir().expect("tempdir");
        let paths = fresh_upload(temp.path(), 10);
        let data = payload(25);

        let report = run_pipeline(&data[..], &paths, hold(), 0, 10, false).await;
        assert!(matches!(report.result, Err(UploadError::BodyTooLong)));
        assert_eq!(report.committed, 10);
        assert_eq!(
            std::fs::metadata(&paths.partial_path).expect("meta").len(),
            10
        );
    }

    #[tokio::test]
    async fn empty_body_for_zero_count_succeeds() {
        let temp = tempdir().expect("tempdir");
        let paths = fresh_upload(temp.path(), 0);
        let report = run_pipeline(&b""[..], &paths, hold(), 0, 0, false).await;
        report.result.expect("empty upload");
        assert_eq!(report.committed, 0);
    }

    #[tokio::test]
    async fn dropped_pipeline_keeps_key_busy_until_writer_closes() {
        let temp = tempdir().expect("tempdir");
        let len = COALESCE_THRESHOLD * 2;
        let paths = fresh_upload(temp.path(), len as u64);
        let registry = BusyRegistry::new();
        let guard = registry.try_acquire(&paths.key).expect("acquire");

        // Less than one coalesced write, then the body never ends.
        let sent = COALESCE_THRESHOLD - 1000;
        let (mut client, server) = tokio::io::duplex(COALESCE_THRESHOLD);
        tokio::io::AsyncWriteExt::write_all(&mut client, &payload(sent))
            .await
            .expect("send body");
        let pipeline = run_pipeline(server, &paths, guard, 0, len as u64, true);
        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(200), pipeline).await;
        assert!(timed_out.is_err());

        let started = std::time::Instant::now();
        let _next = loop {
            if let Some(next) = registry.try_acquire(&paths.key) {
                break next;
            }
            assert!(started.elapsed().as_secs() < 5, "writer never released the key");
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        };
        // The pending bytes were flushed before the key came free.
        assert_eq!(
            std::fs::metadata(&paths.partial_path).expect("meta").len(),
            sent as u64
        );
        drop(client);
    }

    #[tokio::test]
    async fn missing_journal_fails_in_writer() {
        let temp = tempdir().expect("tempdir");
        let paths = UploadPaths::new("x.bin".into(), temp.path().join("x.bin"));
        let data = payload(10);
        let report = run_pipeline(&data[..], &paths, hold(), 0, 10, false).await;
        assert!(matches!(report.result, Err(UploadError::Write(_))));
        assert_eq!(report.committed, 0);
    }
}

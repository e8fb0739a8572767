//! Streaming tar+gzip archive codec
//!
//! Building an archive runs two blocking stages, the tar writer and the gzip
//! compressor, connected to each other and to the caller by bounded channels.
//! A slow consumer of the compressed stream therefore stalls the writer
//! instead of buffering the archive in memory.
//!
//! Reading is the reverse: a blocking task decodes the stream and hands out
//! one entry at a time. The next entry is only decoded once the caller asks
//! for it, so entries are handled strictly in construction order.

use bytes::{Buf, Bytes};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::stream;
use mirror_core::MirrorError;
use mirror_gateway::ByteReader;
use std::future::Future;
use std::io::{self, Cursor, Read, Write};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{task_failure, ServiceResult};
use crate::pipeline::{Stage, StreamChain};

const CHUNK_SIZE: usize = 64 * 1024;
const CHANNEL_DEPTH: usize = 8;

type Chunk = io::Result<Bytes>;

/// Kind of an archive entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Regular file
    File,
    /// Directory
    Directory,
    /// Links, devices and anything else
    Other,
}

/// Header of an archive entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    /// Path-like entry name
    pub name: String,
    /// Entry kind
    pub kind: EntryKind,
    /// Content size in bytes
    pub size: u64,
}

/// One entry handed out by [`ArchiveReader`]
pub struct ArchiveEntry {
    /// Entry header
    pub header: EntryHeader,
    /// Entry content, exactly `header.size` bytes
    pub content: ByteReader,
}

impl std::fmt::Debug for ArchiveEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveEntry").field("header", &self.header).finish()
    }
}

fn copy_error(err: &io::Error) -> io::Error {
    io::Error::new(err.kind(), err.to_string())
}

fn archive_error(operation: &str, err: io::Error) -> MirrorError {
    match err.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput | io::ErrorKind::UnexpectedEof => {
            MirrorError::Validation(format!("{}: {}", operation, err))
        }
        _ => MirrorError::Io(format!("{}: {}", operation, err)),
    }
}

fn channel_reader(chunks: mpsc::Receiver<Chunk>) -> ByteReader {
    let chunks = stream::unfold(chunks, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    });
    Box::new(StreamReader::new(Box::pin(chunks)))
}

/// Blocking writer feeding a bounded chunk channel
struct ChunkWriter {
    tx: mpsc::Sender<Chunk>,
    token: CancellationToken,
    closed: bool,
}

impl ChunkWriter {
    fn new(tx: mpsc::Sender<Chunk>, token: CancellationToken) -> Self {
        Self {
            tx,
            token,
            closed: false,
        }
    }

    /// Refuse further writes, so trailers flushed on drop never reach the consumer
    fn close(&mut self) {
        self.closed = true;
    }
}

impl Write for ChunkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed || self.token.is_cancelled() {
            return Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "archive stream chain destroyed",
            ));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "downstream stage closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Blocking reader draining a chunk channel
struct ChunkReader {
    rx: mpsc::Receiver<Chunk>,
    current: Bytes,
}

impl ChunkReader {
    fn new(rx: mpsc::Receiver<Chunk>) -> Self {
        Self {
            rx,
            current: Bytes::new(),
        }
    }
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.current.is_empty() {
            match self.rx.blocking_recv() {
                None => return Ok(0),
                Some(Err(e)) => return Err(e),
                Some(Ok(chunk)) => self.current = chunk,
            }
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        Ok(n)
    }
}

/// Reader yielding exactly the declared size of an entry
struct SizedReader<R> {
    inner: R,
    name: String,
    declared: u64,
    remaining: u64,
}

impl<R: Read> SizedReader<R> {
    fn new(inner: R, name: &str, declared: u64) -> Self {
        Self {
            inner,
            name: name.to_string(),
            declared,
            remaining: declared,
        }
    }

    /// Fail if the body holds more than the declared size
    fn finish(mut self) -> io::Result<()> {
        let mut probe = [0u8; 1];
        loop {
            match self.inner.read(&mut probe) {
                Ok(0) => return Ok(()),
                Ok(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!(
                            "entry {} is longer than its declared {} bytes",
                            self.name, self.declared
                        ),
                    ))
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl<R: Read> Read for SizedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = usize::try_from(self.remaining)
            .unwrap_or(usize::MAX)
            .min(buf.len());
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "entry {} ended after {} of {} declared bytes",
                    self.name,
                    self.declared - self.remaining,
                    self.declared
                ),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

enum SinkCommand {
    File {
        name: String,
        size: u64,
        body: ByteReader,
        done: oneshot::Sender<io::Result<()>>,
    },
    Directory {
        name: String,
        done: oneshot::Sender<io::Result<()>>,
    },
}

/// Write side of an archive under construction
///
/// Entries land in the archive in the order they are added. Each add call
/// returns once the entry content has been fully written, so a failing
/// entry surfaces on the call that added it.
pub struct ArchiveSink {
    commands: mpsc::Sender<SinkCommand>,
    written: usize,
}

impl std::fmt::Debug for ArchiveSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveSink")
            .field("written", &self.written)
            .finish()
    }
}

impl ArchiveSink {
    async fn submit(
        &mut self,
        name: &str,
        command: SinkCommand,
        done: oneshot::Receiver<io::Result<()>>,
    ) -> ServiceResult<()> {
        let closed = || MirrorError::Io(format!("archive writer closed before entry {}", name));

        self.commands.send(command).await.map_err(|_| closed())?;
        match done.await {
            Ok(Ok(())) => {
                self.written += 1;
                debug!(entry = %name, "archive entry written");
                Ok(())
            }
            Ok(Err(e)) => Err(archive_error(&format!("writing entry {}", name), e)),
            Err(_) => Err(closed()),
        }
    }

    /// Append a file entry whose body must hold exactly `size` bytes
    pub async fn add_entry(
        &mut self,
        name: impl Into<String>,
        size: u64,
        body: ByteReader,
    ) -> ServiceResult<()> {
        let name = name.into();
        let (done, result) = oneshot::channel();
        let command = SinkCommand::File {
            name: name.clone(),
            size,
            body,
            done,
        };
        self.submit(&name, command, result).await
    }

    /// Append a file entry from memory
    pub async fn add_bytes(&mut self, name: impl Into<String>, data: Vec<u8>) -> ServiceResult<()> {
        let size = data.len() as u64;
        self.add_entry(name, size, Box::new(Cursor::new(data))).await
    }

    /// Append a directory entry
    pub async fn add_directory(&mut self, name: impl Into<String>) -> ServiceResult<()> {
        let name = name.into();
        let (done, result) = oneshot::channel();
        let command = SinkCommand::Directory {
            name: name.clone(),
            done,
        };
        self.submit(&name, command, result).await
    }

    /// Number of entries written so far
    pub fn entries_written(&self) -> usize {
        self.written
    }

    /// Signal end-of-archive
    pub fn finish(self) {
        debug!(entries = self.written, "archive sink closed");
    }
}

/// The two blocking stages of an archive build
#[derive(Debug)]
pub struct ArchiveTasks {
    writer: JoinHandle<io::Result<()>>,
    compressor: JoinHandle<io::Result<()>>,
}

impl ArchiveTasks {
    /// Wait for both stages, reporting the first failure
    pub async fn join(self) -> ServiceResult<()> {
        let writer = self
            .writer
            .await
            .map_err(|e| task_failure(e, "archive writer"))?;
        let compressor = self
            .compressor
            .await
            .map_err(|e| task_failure(e, "compressor"))?;

        writer.map_err(|e| archive_error("archive writer", e))?;
        compressor.map_err(|e| archive_error("compressor", e))?;
        Ok(())
    }
}

fn tar_header(kind: tar::EntryType, size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(kind);
    header.set_size(size);
    header.set_mode(if kind.is_dir() { 0o755 } else { 0o644 });
    header.set_mtime(0);
    header
}

fn append_file<W: Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    size: u64,
    body: ByteReader,
    handle: &Handle,
) -> io::Result<()> {
    let mut header = tar_header(tar::EntryType::Regular, size);
    let bridge = SyncIoBridge::new_with_handle(body, handle.clone());
    let mut content = SizedReader::new(bridge, name, size);
    builder.append_data(&mut header, name, &mut content)?;
    content.finish()
}

fn append_directory<W: Write>(builder: &mut tar::Builder<W>, name: &str) -> io::Result<()> {
    let mut header = tar_header(tar::EntryType::Directory, 0);
    builder.append_data(&mut header, name, io::empty())
}

fn run_writer(
    mut commands: mpsc::Receiver<SinkCommand>,
    output: ChunkWriter,
    handle: Handle,
) -> io::Result<()> {
    let mut builder = tar::Builder::new(io::BufWriter::with_capacity(CHUNK_SIZE, output));
    builder.mode(tar::HeaderMode::Deterministic);

    while let Some(command) = commands.blocking_recv() {
        let (result, done) = match command {
            SinkCommand::File {
                name,
                size,
                body,
                done,
            } => (append_file(&mut builder, &name, size, body, &handle), done),
            SinkCommand::Directory { name, done } => (append_directory(&mut builder, &name), done),
        };
        if let Err(e) = result {
            let _ = done.send(Err(copy_error(&e)));
            builder.get_mut().get_mut().close();
            return Err(e);
        }
        let _ = done.send(Ok(()));
    }

    let mut output = builder.into_inner()?;
    output.flush()
}

fn run_compressor(mut input: ChunkReader, output: ChunkWriter) -> io::Result<()> {
    let mut encoder = GzEncoder::new(
        io::BufWriter::with_capacity(CHUNK_SIZE, output),
        Compression::default(),
    );
    if let Err(e) = io::copy(&mut input, &mut encoder) {
        encoder.get_mut().get_mut().close();
        return Err(e);
    }
    let mut output = encoder.finish()?;
    output.flush()
}

/// Start building an archive
///
/// Returns the sink entries are written to, the compressed archive stream
/// and the handles of the two blocking stages. The compressed stream must be
/// consumed concurrently with writing. Dropping it stalls and then fails the
/// writer. Must be called from within a Tokio runtime.
pub fn build_archive(chain: &StreamChain) -> (ArchiveSink, ByteReader, ArchiveTasks) {
    let handle = Handle::current();
    let (command_tx, command_rx) = mpsc::channel(1);
    let (tar_tx, tar_rx) = mpsc::channel::<Chunk>(CHANNEL_DEPTH);
    let (gz_tx, gz_rx) = mpsc::channel::<Chunk>(CHANNEL_DEPTH);

    let writer = {
        let chain = chain.clone();
        let output = ChunkWriter::new(tar_tx.clone(), chain.token());
        tokio::task::spawn_blocking(move || {
            let result = run_writer(command_rx, output, handle);
            match &result {
                Ok(()) => chain.finish(Stage::ArchiveWriter),
                Err(e) => {
                    debug!(error = %e, "archive writer failed");
                    let _ = tar_tx.blocking_send(Err(copy_error(e)));
                }
            }
            result
        })
    };

    let compressor = {
        let chain = chain.clone();
        let output = ChunkWriter::new(gz_tx.clone(), chain.token());
        tokio::task::spawn_blocking(move || {
            let result = run_compressor(ChunkReader::new(tar_rx), output);
            match &result {
                Ok(()) => chain.finish(Stage::Compressor),
                Err(e) => {
                    debug!(error = %e, "compressor failed");
                    let _ = gz_tx.blocking_send(Err(copy_error(e)));
                }
            }
            result
        })
    };

    let sink = ArchiveSink {
        commands: command_tx,
        written: 0,
    };
    (sink, channel_reader(gz_rx), ArchiveTasks { writer, compressor })
}

/// Handshake for the entry currently handed out
struct PendingEntry {
    skip: CancellationToken,
    resume: Option<oneshot::Sender<()>>,
}

impl Drop for PendingEntry {
    fn drop(&mut self) {
        self.skip.cancel();
    }
}

struct ReaderItem {
    header: EntryHeader,
    content: mpsc::Receiver<Chunk>,
    pending: PendingEntry,
}

fn send_chunk(
    handle: &Handle,
    chunks: &mpsc::Sender<Chunk>,
    skip: &CancellationToken,
    chunk: Chunk,
) -> bool {
    if skip.is_cancelled() {
        return false;
    }
    handle.block_on(async {
        tokio::select! {
            sent = chunks.send(chunk) => sent.is_ok(),
            _ = skip.cancelled() => false,
        }
    })
}

/// Forward one entry's content until it ends or the consumer lets go
///
/// Content left unread once the consumer lets go is skipped by the tar
/// decoder when the next entry is requested.
fn pump_entry<R: Read>(
    entry: &mut R,
    header: &EntryHeader,
    chunks: &mpsc::Sender<Chunk>,
    skip: &CancellationToken,
    handle: &Handle,
) -> io::Result<()> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut seen: u64 = 0;

    loop {
        if skip.is_cancelled() {
            return Ok(());
        }
        let n = match entry.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                send_chunk(handle, chunks, skip, Err(copy_error(&e)));
                return Err(e);
            }
        };
        seen += n as u64;
        if !send_chunk(handle, chunks, skip, Ok(Bytes::copy_from_slice(&buf[..n]))) {
            return Ok(());
        }
    }

    if seen != header.size {
        let err = io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!(
                "entry {} truncated after {} of {} bytes",
                header.name, seen, header.size
            ),
        );
        send_chunk(handle, chunks, skip, Err(copy_error(&err)));
        return Err(err);
    }
    Ok(())
}

fn entry_header<R: Read>(entry: &tar::Entry<'_, R>) -> io::Result<EntryHeader> {
    let entry_type = entry.header().entry_type();
    let kind = if entry_type.is_file() {
        EntryKind::File
    } else if entry_type.is_dir() {
        EntryKind::Directory
    } else {
        EntryKind::Other
    };
    Ok(EntryHeader {
        name: entry.path()?.to_string_lossy().into_owned(),
        kind,
        size: entry.size(),
    })
}

fn read_entries(
    stream: ByteReader,
    items: &mpsc::Sender<io::Result<ReaderItem>>,
    handle: &Handle,
) -> io::Result<()> {
    let decoder = GzDecoder::new(SyncIoBridge::new_with_handle(stream, handle.clone()));
    let mut archive = tar::Archive::new(decoder);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let header = entry_header(&entry)?;

        let (chunk_tx, chunk_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (resume_tx, resume_rx) = oneshot::channel();
        let skip = CancellationToken::new();
        let item = ReaderItem {
            header: header.clone(),
            content: chunk_rx,
            pending: PendingEntry {
                skip: skip.clone(),
                resume: Some(resume_tx),
            },
        };
        if items.blocking_send(Ok(item)).is_err() {
            return Ok(());
        }

        pump_entry(&mut entry, &header, &chunk_tx, &skip, handle)?;
        drop(chunk_tx);

        // The reader was dropped without asking for the next entry
        if resume_rx.blocking_recv().is_err() {
            return Ok(());
        }
    }
    Ok(())
}

/// Lazy, restartable sequence over the entries of a compressed archive
///
/// Each call to [`ArchiveReader::next_entry`] releases the previous entry
/// (discarding any content left unread) and decodes the next one.
pub struct ArchiveReader {
    items: mpsc::Receiver<io::Result<ReaderItem>>,
    current: Option<PendingEntry>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for ArchiveReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveReader")
            .field("holding_entry", &self.current.is_some())
            .finish()
    }
}

impl ArchiveReader {
    /// Start decoding `stream`. Must be called from within a Tokio runtime.
    pub fn new(stream: ByteReader) -> Self {
        let handle = Handle::current();
        let (tx, items) = mpsc::channel(1);
        let task = tokio::task::spawn_blocking(move || {
            if let Err(e) = read_entries(stream, &tx, &handle) {
                debug!(error = %e, "archive decoding failed");
                let _ = tx.blocking_send(Err(e));
            }
        });
        Self {
            items,
            current: None,
            task,
        }
    }

    fn release_current(&mut self) {
        if let Some(mut pending) = self.current.take() {
            if let Some(resume) = pending.resume.take() {
                let _ = resume.send(());
            }
        }
    }

    /// Advance to the next entry; `None` once the archive ends
    pub async fn next_entry(&mut self) -> ServiceResult<Option<ArchiveEntry>> {
        self.release_current();
        match self.items.recv().await {
            None => Ok(None),
            Some(Err(e)) => Err(archive_error("reading archive", e)),
            Some(Ok(item)) => {
                self.current = Some(item.pending);
                Ok(Some(ArchiveEntry {
                    header: item.header,
                    content: channel_reader(item.content),
                }))
            }
        }
    }

    /// Stop reading and wait for the decoder to wind down
    pub async fn close(mut self) -> ServiceResult<()> {
        self.release_current();
        let ArchiveReader { items, task, .. } = self;
        drop(items);
        task.await.map_err(|e| task_failure(e, "archive reader"))
    }
}

/// Read an archive entry by entry
///
/// `on_entry` is awaited for each entry before the next one is decoded.
/// The first error, from decoding or from the handler, stops the read.
pub async fn read_archive<F, Fut>(stream: ByteReader, mut on_entry: F) -> ServiceResult<()>
where
    F: FnMut(EntryHeader, ByteReader) -> Fut,
    Fut: Future<Output = ServiceResult<()>>,
{
    let mut reader = ArchiveReader::new(stream);
    while let Some(entry) = reader.next_entry().await? {
        on_entry(entry.header, entry.content).await?;
    }
    reader.close().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StageState;
    use mirror_core::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::io::AsyncReadExt;

    async fn build(entries: Vec<(&str, Vec<u8>)>) -> Vec<u8> {
        let chain = StreamChain::new();
        let (mut sink, mut output, tasks) = build_archive(&chain);
        let collector = tokio::spawn(async move {
            let mut buf = Vec::new();
            output.read_to_end(&mut buf).await.map(|_| buf)
        });

        for (name, data) in entries {
            sink.add_bytes(name, data).await.unwrap();
        }
        sink.finish();
        tasks.join().await.unwrap();
        let archive = collector.await.unwrap().unwrap();

        assert_eq!(chain.state(Stage::ArchiveWriter), StageState::Finished);
        assert_eq!(chain.state(Stage::Compressor), StageState::Finished);
        archive
    }

    fn reader(data: Vec<u8>) -> ByteReader {
        Box::new(Cursor::new(data))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_entries_read_back_in_order() {
        let big = vec![7u8; 3 * CHUNK_SIZE + 11];
        let archive = build(vec![
            ("1.json", b"{\"v\":1}".to_vec()),
            ("releases/1.0.0.json", b"{}".to_vec()),
            ("files/f1.json", big.clone()),
        ])
        .await;

        let mut reader = ArchiveReader::new(reader(archive));
        let mut names = Vec::new();
        while let Some(mut entry) = reader.next_entry().await.unwrap() {
            let mut content = Vec::new();
            entry.content.read_to_end(&mut content).await.unwrap();
            assert_eq!(entry.header.kind, EntryKind::File);
            assert_eq!(entry.header.size, content.len() as u64);
            if entry.header.name == "files/f1.json" {
                assert_eq!(content, big);
            }
            names.push(entry.header.name);
        }
        reader.close().await.unwrap();

        assert_eq!(names, vec!["1.json", "releases/1.0.0.json", "files/f1.json"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unread_content_is_skipped() {
        let archive = build(vec![
            ("large.bin", vec![1u8; 20 * CHUNK_SIZE]),
            ("small.txt", b"hello".to_vec()),
        ])
        .await;

        let mut reader = ArchiveReader::new(reader(archive));
        let first = reader.next_entry().await.unwrap().unwrap();
        assert_eq!(first.header.name, "large.bin");
        drop(first);

        let mut second = reader.next_entry().await.unwrap().unwrap();
        let mut content = String::new();
        second.content.read_to_string(&mut content).await.unwrap();
        assert_eq!(content, "hello");
        assert!(reader.next_entry().await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_directory_entries_are_tagged() {
        let chain = StreamChain::new();
        let (mut sink, mut output, tasks) = build_archive(&chain);
        let collector = tokio::spawn(async move {
            let mut buf = Vec::new();
            output.read_to_end(&mut buf).await.map(|_| buf)
        });
        sink.add_directory("blobs").await.unwrap();
        sink.add_bytes("blobs/a", b"a".to_vec()).await.unwrap();
        assert_eq!(sink.entries_written(), 2);
        sink.finish();
        tasks.join().await.unwrap();

        let kinds = Arc::new(Mutex::new(Vec::new()));
        let seen = kinds.clone();
        read_archive(reader(collector.await.unwrap().unwrap()), move |header, _| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(header.kind);
                Ok(())
            }
        })
        .await
        .unwrap();

        assert_eq!(
            *kinds.lock().unwrap(),
            vec![EntryKind::Directory, EntryKind::File]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_short_body_rejected() {
        let chain = StreamChain::new();
        let (mut sink, mut output, tasks) = build_archive(&chain);
        let drain = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = output.read_to_end(&mut buf).await;
        });

        let err = sink
            .add_entry("short.bin", 10, reader(vec![0u8; 4]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        sink.finish();
        assert!(tasks.join().await.is_err());
        drain.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_long_body_rejected() {
        let chain = StreamChain::new();
        let (mut sink, mut output, tasks) = build_archive(&chain);
        let drain = tokio::spawn(async move {
            let mut buf = Vec::new();
            output.read_to_end(&mut buf).await
        });

        assert!(sink
            .add_entry("long.bin", 2, reader(vec![0u8; 4]))
            .await
            .is_err());
        sink.finish();
        assert!(tasks.join().await.is_err());
        assert!(drain.await.unwrap().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_handler_error_stops_reading() {
        let archive = build(vec![("a", b"1".to_vec()), ("b", b"2".to_vec())]).await;
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();

        let result = read_archive(reader(archive), move |_, _| {
            let counter = counter.clone();
            async move {
                *counter.lock().unwrap() += 1;
                Err(MirrorError::Validation("rejected".to_string()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    /// Source stream recording how many compressed bytes were pulled
    struct CountingReader {
        inner: Cursor<Vec<u8>>,
        read: Arc<AtomicUsize>,
    }

    impl tokio::io::AsyncRead for CountingReader {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            let before = buf.filled().len();
            let poll = std::pin::Pin::new(&mut self.inner).poll_read(cx, buf);
            let pulled = buf.filled().len() - before;
            self.read.fetch_add(pulled, Ordering::SeqCst);
            poll
        }
    }

    /// Bytes that gzip cannot shrink
    fn noise(len: usize) -> Vec<u8> {
        let mut state: u32 = 0x9e37_79b9;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rejected_entry_stops_decoding() {
        let archive = build(vec![
            ("weights.bin", noise(64 * CHUNK_SIZE)),
            ("after.txt", b"never reached".to_vec()),
        ])
        .await;
        let total = archive.len();
        let read = Arc::new(AtomicUsize::new(0));
        let source = CountingReader {
            inner: Cursor::new(archive),
            read: read.clone(),
        };

        let result = read_archive(Box::new(source), |_, mut content| async move {
            let mut first = vec![0u8; CHUNK_SIZE];
            content.read_exact(&mut first).await?;
            Err(MirrorError::Io("destination refused the write".to_string()))
        })
        .await;
        assert!(result.is_err());

        let at_error = read.load(Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        let settled = read.load(Ordering::SeqCst);

        assert!(
            settled < total / 2,
            "decoder kept reading: {} of {} bytes",
            settled,
            total
        );
        assert!(settled - at_error < total / 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_corrupt_stream_rejected() {
        let mut reader = ArchiveReader::new(reader(b"definitely not gzip".to_vec()));
        assert!(reader.next_entry().await.is_err());
    }

    #[test]
    fn test_sized_reader_exact() {
        let mut sized = SizedReader::new(Cursor::new(vec![1u8, 2, 3]), "x", 3);
        let mut out = Vec::new();
        sized.read_to_end(&mut out).unwrap();
        assert_eq!(out, vec![1, 2, 3]);
        assert!(sized.finish().is_ok());
    }
}

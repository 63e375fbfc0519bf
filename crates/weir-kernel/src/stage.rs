//! Pipeline stage kinds and the byte source/sink adapters behind them.
//!
//! A pipeline starts from a [`Source`] and continues through [`Stage`]s.
//! Process handles relay bytes themselves; every other kind is lowered to a
//! [`ByteSource`] or [`ByteSink`] and driven by one pipeline task, so the
//! pumping logic is the same no matter which concrete adapter sits behind it.

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::channel::{ChannelReader, ChannelWriter};
use crate::process::ProcessHandle;

const READ_CHUNK: usize = 8 * 1024;

/// Something that produces bytes until it runs dry.
#[async_trait]
pub trait ByteSource: Send {
    /// Next chunk, or `None` at end.
    async fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>>;

    fn describe(&self) -> String;
}

/// Something that accepts bytes and is finalized once.
#[async_trait]
pub trait ByteSink: Send {
    async fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Flush and release. Called once, after the last write.
    async fn finish(&mut self) -> io::Result<()>;

    fn describe(&self) -> String;
}

/// Where a pipeline's bytes come from.
pub enum Source {
    /// A process handle; started with its stdout captured.
    Process(Arc<ProcessHandle>),
    File(PathBuf),
    Stream(Box<dyn AsyncRead + Send + Unpin>),
    Channel(ChannelReader),
    Text(String),
    Custom(Box<dyn ByteSource>),
}

/// One link after the source. Everything but `Process` is a terminal sink.
pub enum Stage {
    Process(Arc<ProcessHandle>),
    /// Create or truncate a file.
    File(PathBuf),
    AppendFile(PathBuf),
    Stream(Box<dyn AsyncWrite + Send + Unpin>),
    Channel(ChannelWriter),
    Text(Accumulator),
    Custom(Box<dyn ByteSink>),
}

impl Source {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Source::File(path.into())
    }

    pub fn stream(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Source::Stream(Box::new(reader))
    }

    pub fn describe(&self) -> String {
        match self {
            Source::Process(handle) => handle.command(),
            Source::File(path) => format!("file {}", path.display()),
            Source::Stream(_) => "stream".to_string(),
            Source::Channel(_) => "channel".to_string(),
            Source::Text(_) => "text".to_string(),
            Source::Custom(source) => source.describe(),
        }
    }

    /// Lower a non-process source to its adapter.
    pub(crate) fn into_byte_source(self) -> Result<Box<dyn ByteSource>, Arc<ProcessHandle>> {
        Ok(match self {
            Source::Process(handle) => return Err(handle),
            Source::File(path) => Box::new(FileSource::new(path)),
            Source::Stream(reader) => Box::new(ReaderSource::new("stream", reader)),
            Source::Channel(reader) => Box::new(ChannelSource(reader)),
            Source::Text(text) => Box::new(TextSource::new(text)),
            Source::Custom(source) => source,
        })
    }
}

impl Stage {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Stage::File(path.into())
    }

    pub fn append(path: impl Into<PathBuf>) -> Self {
        Stage::AppendFile(path.into())
    }

    pub fn stream(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Stage::Stream(Box::new(writer))
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Stage::Process(_))
    }

    pub fn describe(&self) -> String {
        match self {
            Stage::Process(handle) => handle.command(),
            Stage::File(path) => format!("file {}", path.display()),
            Stage::AppendFile(path) => format!("file >>{}", path.display()),
            Stage::Stream(_) => "stream".to_string(),
            Stage::Channel(_) => "channel".to_string(),
            Stage::Text(_) => "text".to_string(),
            Stage::Custom(sink) => sink.describe(),
        }
    }

    /// Lower a terminal stage to its adapter.
    pub(crate) fn into_byte_sink(self) -> Result<Box<dyn ByteSink>, Arc<ProcessHandle>> {
        Ok(match self {
            Stage::Process(handle) => return Err(handle),
            Stage::File(path) => Box::new(FileSink::new(path, false)),
            Stage::AppendFile(path) => Box::new(FileSink::new(path, true)),
            Stage::Stream(writer) => Box::new(WriterSink::new("stream", writer)),
            Stage::Channel(writer) => Box::new(ChannelSink(writer)),
            Stage::Text(acc) => Box::new(AccumulatorSink(acc)),
            Stage::Custom(sink) => sink,
        })
    }
}

impl From<Arc<ProcessHandle>> for Source {
    fn from(handle: Arc<ProcessHandle>) -> Self {
        Source::Process(handle)
    }
}

impl From<&str> for Source {
    fn from(text: &str) -> Self {
        Source::Text(text.to_string())
    }
}

impl From<String> for Source {
    fn from(text: String) -> Self {
        Source::Text(text)
    }
}

impl From<ChannelReader> for Source {
    fn from(reader: ChannelReader) -> Self {
        Source::Channel(reader)
    }
}

impl From<Arc<ProcessHandle>> for Stage {
    fn from(handle: Arc<ProcessHandle>) -> Self {
        Stage::Process(handle)
    }
}

impl From<Accumulator> for Stage {
    fn from(acc: Accumulator) -> Self {
        Stage::Text(acc)
    }
}

impl From<ChannelWriter> for Stage {
    fn from(writer: ChannelWriter) -> Self {
        Stage::Channel(writer)
    }
}

// --- Sources ---

/// A string literal, produced in one chunk.
pub struct TextSource {
    data: Option<Vec<u8>>,
}

impl TextSource {
    pub fn new(text: impl Into<String>) -> Self {
        let data = text.into().into_bytes();
        Self {
            data: (!data.is_empty()).then_some(data),
        }
    }
}

#[async_trait]
impl ByteSource for TextSource {
    async fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.data.take())
    }

    fn describe(&self) -> String {
        "text".to_string()
    }
}

/// Any async reader, in chunks of up to 8 KiB.
pub struct ReaderSource<R> {
    label: String,
    reader: R,
    buf: Vec<u8>,
}

impl<R> ReaderSource<R> {
    pub fn new(label: impl Into<String>, reader: R) -> Self {
        Self {
            label: label.into(),
            reader,
            buf: vec![0u8; READ_CHUNK],
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Send + Unpin> ByteSource for ReaderSource<R> {
    async fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        let n = self.reader.read(&mut self.buf).await?;
        Ok((n > 0).then(|| self.buf[..n].to_vec()))
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// A file, opened on first read so open errors surface in the stage task.
pub struct FileSource {
    path: PathBuf,
    inner: Option<ReaderSource<File>>,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            inner: None,
        }
    }
}

#[async_trait]
impl ByteSource for FileSource {
    async fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.inner.is_none() {
            let file = File::open(&self.path).await?;
            self.inner = Some(ReaderSource::new(self.describe(), file));
        }
        match self.inner.as_mut() {
            Some(inner) => inner.next_chunk().await,
            None => Ok(None),
        }
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }
}

/// An externally supplied channel.
pub struct ChannelSource(pub ChannelReader);

#[async_trait]
impl ByteSource for ChannelSource {
    async fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.0.recv().await)
    }

    fn describe(&self) -> String {
        "channel".to_string()
    }
}

// --- Sinks ---

/// In-memory accumulator. Clone it before handing it to a pipeline and read
/// the contents after the pipeline is awaited.
#[derive(Debug, Clone, Default)]
pub struct Accumulator {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Contents as text; invalid UTF-8 is replaced.
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.lock()).into_owned()
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.buf.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct AccumulatorSink(pub Accumulator);

#[async_trait]
impl ByteSink for AccumulatorSink {
    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.0.lock().extend_from_slice(data);
        Ok(())
    }

    async fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        "text".to_string()
    }
}

/// Any async writer. Shut down on finish.
pub struct WriterSink<W> {
    label: String,
    writer: W,
}

impl<W> WriterSink<W> {
    pub fn new(label: impl Into<String>, writer: W) -> Self {
        Self {
            label: label.into(),
            writer,
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Send + Unpin> ByteSink for WriterSink<W> {
    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data).await
    }

    async fn finish(&mut self) -> io::Result<()> {
        self.writer.flush().await?;
        self.writer.shutdown().await
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// A file, created (or opened for append) on first write or at finish.
pub struct FileSink {
    path: PathBuf,
    append: bool,
    file: Option<File>,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>, append: bool) -> Self {
        Self {
            path: path.into(),
            append,
            file: None,
        }
    }

    async fn file(&mut self) -> io::Result<&mut File> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .append(self.append)
                .truncate(!self.append)
                .open(&self.path)
                .await?;
            self.file = Some(file);
        }
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("file sink not open"))
    }
}

#[async_trait]
impl ByteSink for FileSink {
    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.file().await?.write_all(data).await
    }

    async fn finish(&mut self) -> io::Result<()> {
        // An empty stream still leaves an (empty) file behind.
        let file = self.file().await?;
        file.flush().await?;
        file.sync_data().await
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }
}

/// An externally supplied channel; closed on finish.
pub struct ChannelSink(pub ChannelWriter);

#[async_trait]
impl ByteSink for ChannelSink {
    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.0.send(data).await
    }

    async fn finish(&mut self) -> io::Result<()> {
        self.0.close();
        Ok(())
    }

    fn describe(&self) -> String {
        "channel".to_string()
    }
}

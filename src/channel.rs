//! Auxiliary channels: sequential files holding serialized elements.

use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::io::prelude::*;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::record::{parse_record, RecordSource, RecordWarning, Warnings};
use crate::sort::SortError;

/// Channel identifier, unique inside a sort session.
pub type ChannelId = u64;

/// Channel encoding error.
#[derive(Debug)]
pub enum ChannelError {
    /// Underlying file operation failed.
    Io(io::Error),
    /// Element could not be serialized.
    Serialization(String),
    /// Channel content could not be deserialized. The stream can't be resumed.
    Deserialization(String),
    /// A single record is malformed; reading may continue with the next one.
    Malformed { record: String, reason: String },
}

impl Error for ChannelError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            ChannelError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            ChannelError::Io(err) => write!(f, "channel I/O error: {}", err),
            ChannelError::Serialization(err) => write!(f, "element serialization error: {}", err),
            ChannelError::Deserialization(err) => write!(f, "element deserialization error: {}", err),
            ChannelError::Malformed { record, reason } => write!(f, "malformed record {:?}: {}", record, reason),
        }
    }
}

impl From<io::Error> for ChannelError {
    fn from(err: io::Error) -> Self {
        ChannelError::Io(err)
    }
}

/// Channel element encoding.
pub trait ChannelCodec<T>: Send + Sync {
    /// Writes one element.
    fn encode<W: Write>(writer: &mut W, item: &T) -> Result<(), ChannelError>;

    /// Reads the next element. Returns [`None`] at the end of the channel.
    fn decode<R: BufRead>(reader: &mut R) -> Option<Result<T, ChannelError>>;
}

/// RMP (Rust MessagePack) channel encoding.
/// For more information see https://msgpack.org/.
pub struct RmpCodec;

impl<T> ChannelCodec<T> for RmpCodec
where
    T: serde::ser::Serialize + serde::de::DeserializeOwned,
{
    fn encode<W: Write>(writer: &mut W, item: &T) -> Result<(), ChannelError> {
        let bytes = rmp_serde::to_vec(item).map_err(|err| ChannelError::Serialization(err.to_string()))?;
        writer.write_all(&bytes)?;

        return Ok(());
    }

    fn decode<R: BufRead>(reader: &mut R) -> Option<Result<T, ChannelError>> {
        match reader.fill_buf() {
            Ok(buf) if buf.is_empty() => return None,
            Ok(_) => {}
            Err(err) => return Some(Err(ChannelError::Io(err))),
        }

        Some(rmp_serde::decode::from_read(reader).map_err(|err| match err {
            rmp_serde::decode::Error::InvalidMarkerRead(err) => ChannelError::Io(err),
            rmp_serde::decode::Error::InvalidDataRead(err) => ChannelError::Io(err),
            err => ChannelError::Deserialization(err.to_string()),
        }))
    }
}

/// Text channel encoding: one element per line.
/// Lines that don't parse are reported as malformed and can be skipped.
pub struct TextCodec;

impl<T> ChannelCodec<T> for TextCodec
where
    T: FromStr + fmt::Display,
    T::Err: fmt::Display,
{
    fn encode<W: Write>(writer: &mut W, item: &T) -> Result<(), ChannelError> {
        writeln!(writer, "{}", item)?;

        return Ok(());
    }

    fn decode<R: BufRead>(reader: &mut R) -> Option<Result<T, ChannelError>> {
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) => None,
            Ok(_) => {
                let record = line.trim_end_matches(&['\r', '\n'][..]);
                Some(parse_record(record).map_err(|reason| ChannelError::Malformed {
                    record: record.to_string(),
                    reason,
                }))
            }
            Err(err) => Some(Err(ChannelError::Io(err))),
        }
    }
}

/// Sealed channel handle. Holds the location and size of the written data.
///
/// A channel has a single owner and is released by value.
#[derive(Debug)]
pub struct Channel {
    pub(crate) id: ChannelId,
    pub(crate) path: PathBuf,
    pub(crate) len: u64,
    pub(crate) items: u64,
}

impl Channel {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of bytes written.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Number of records written.
    pub fn items(&self) -> u64 {
        self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items == 0
    }
}

/// Sink receiving ordered elements, optionally grouped in runs.
pub trait RunSink<T> {
    /// Marks the beginning of a new run.
    fn start_run(&mut self) -> Result<(), SortError>;

    /// Appends an element to the current run.
    fn push(&mut self, item: &T) -> Result<(), SortError>;

    /// Marks the end of the current run.
    fn end_run(&mut self);
}

/// Sequential channel writer. Obtained from the storage manager.
pub struct ChannelWriter<T, C> {
    id: ChannelId,
    path: PathBuf,
    writer: io::BufWriter<fs::File>,
    items: u64,

    item_type: PhantomData<fn(T)>,
    codec_type: PhantomData<C>,
}

impl<T, C> ChannelWriter<T, C>
where
    C: ChannelCodec<T>,
{
    pub(crate) fn new(id: ChannelId, path: PathBuf, file: fs::File, buf_size: Option<usize>) -> Self {
        let writer = match buf_size {
            Some(buf_size) => io::BufWriter::with_capacity(buf_size, file),
            None => io::BufWriter::new(file),
        };

        ChannelWriter {
            id,
            path,
            writer,
            items: 0,
            item_type: PhantomData,
            codec_type: PhantomData,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Number of records written so far.
    pub fn items(&self) -> u64 {
        self.items
    }

    /// Appends an element.
    pub fn write(&mut self, item: &T) -> Result<(), ChannelError> {
        C::encode(&mut self.writer, item)?;
        self.items += 1;

        return Ok(());
    }

    /// Flushes buffered data and seals the channel.
    pub fn finish(self) -> Result<Channel, ChannelError> {
        let file = self.writer.into_inner().map_err(|err| err.into_error())?;
        let len = file.metadata()?.len();

        return Ok(Channel {
            id: self.id,
            path: self.path,
            len,
            items: self.items,
        });
    }
}

impl<T, C> RunSink<T> for ChannelWriter<T, C>
where
    C: ChannelCodec<T>,
{
    fn start_run(&mut self) -> Result<(), SortError> {
        Ok(())
    }

    fn push(&mut self, item: &T) -> Result<(), SortError> {
        self.write(item).map_err(SortError::from)
    }

    fn end_run(&mut self) {}
}

/// Sequential channel reader.
pub struct ChannelReader<T, C> {
    id: ChannelId,
    reader: io::Take<io::BufReader<fs::File>>,

    item_type: PhantomData<fn() -> T>,
    codec_type: PhantomData<C>,
}

impl<T, C> ChannelReader<T, C>
where
    C: ChannelCodec<T>,
{
    pub(crate) fn new(channel: &Channel, buf_size: Option<usize>) -> io::Result<Self> {
        let file = fs::File::open(&channel.path)?;
        let reader = match buf_size {
            Some(buf_size) => io::BufReader::with_capacity(buf_size, file),
            None => io::BufReader::new(file),
        };

        Ok(ChannelReader {
            id: channel.id,
            reader: reader.take(channel.len),
            item_type: PhantomData,
            codec_type: PhantomData,
        })
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Returns a cursor over the next `len` records of the channel.
    /// Malformed records count towards `len` but are skipped and reported to `warnings`.
    pub fn run<'r, 'w>(&'r mut self, len: u64, warnings: &'w Warnings) -> RunCursor<'r, 'w, T, C> {
        RunCursor {
            reader: self,
            remaining: len,
            warnings,
        }
    }

    /// Reads the next well-formed record. Malformed records are skipped and reported to `warnings`.
    pub fn next_valid(&mut self, warnings: &Warnings) -> Option<Result<T, SortError>> {
        loop {
            match self.next()? {
                Ok(item) => return Some(Ok(item)),
                Err(ChannelError::Malformed { record, reason }) => warnings.record(RecordWarning {
                    source: RecordSource::Channel(self.id),
                    record,
                    reason,
                }),
                Err(err) => return Some(Err(err.into())),
            }
        }
    }
}

impl<T, C> Iterator for ChannelReader<T, C>
where
    C: ChannelCodec<T>,
{
    type Item = Result<T, ChannelError>;

    fn next(&mut self) -> Option<Self::Item> {
        C::decode(&mut self.reader)
    }
}

/// Bounded view over one run of a channel.
pub struct RunCursor<'r, 'w, T, C> {
    reader: &'r mut ChannelReader<T, C>,
    remaining: u64,
    warnings: &'w Warnings,
}

impl<'r, 'w, T, C> Iterator for RunCursor<'r, 'w, T, C>
where
    C: ChannelCodec<T>,
{
    type Item = Result<T, SortError>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.remaining > 0 {
            self.remaining -= 1;
            match self.reader.next() {
                Some(Ok(item)) => return Some(Ok(item)),
                Some(Err(ChannelError::Malformed { record, reason })) => self.warnings.record(RecordWarning {
                    source: RecordSource::Channel(self.reader.id),
                    record,
                    reason,
                }),
                Some(Err(err)) => {
                    self.remaining = 0;
                    return Some(Err(err.into()));
                }
                None => {
                    self.remaining = 0;
                    return Some(Err(SortError::StorageIO(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("channel {} ended before the end of the run", self.reader.id),
                    ))));
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::io::Write;

    use rstest::*;
    use serde::{Deserialize, Serialize};

    use super::{Channel, ChannelCodec, ChannelError, ChannelReader, ChannelWriter, RmpCodec, TextCodec};
    use crate::record::{RecordSource, Warnings};

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir_in("./").unwrap()
    }

    fn write_channel<C: ChannelCodec<i64>>(tmp_dir: &tempfile::TempDir, items: &[i64]) -> Channel {
        let path = tmp_dir.path().join("channel");
        let file = fs::File::create(&path).unwrap();
        let mut writer: ChannelWriter<i64, C> = ChannelWriter::new(7, path, file, None);
        for item in items {
            writer.write(item).unwrap();
        }
        writer.finish().unwrap()
    }

    #[rstest]
    fn test_rmp_channel(tmp_dir: tempfile::TempDir) {
        let saved = Vec::from_iter(-50..50);
        let channel = write_channel::<RmpCodec>(&tmp_dir, &saved);
        assert_eq!(channel.items(), 100);

        let reader: ChannelReader<i64, RmpCodec> = ChannelReader::new(&channel, None).unwrap();
        let restored: Result<Vec<i64>, ChannelError> = reader.collect();

        assert_eq!(restored.unwrap(), saved);
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Entry {
        key: u32,
        name: String,
    }

    #[rstest]
    fn test_rmp_channel_structs(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("channel");
        let file = fs::File::create(&path).unwrap();
        let mut writer: ChannelWriter<Entry, RmpCodec> = ChannelWriter::new(1, path, file, Some(16));
        writer.write(&Entry { key: 2, name: "b".to_string() }).unwrap();
        writer.write(&Entry { key: 1, name: "".to_string() }).unwrap();
        let channel = writer.finish().unwrap();

        let reader: ChannelReader<Entry, RmpCodec> = ChannelReader::new(&channel, Some(16)).unwrap();
        let restored: Vec<Entry> = reader.map(Result::unwrap).collect();

        assert_eq!(
            restored,
            vec![
                Entry { key: 2, name: "b".to_string() },
                Entry { key: 1, name: "".to_string() },
            ]
        );
    }

    #[rstest]
    fn test_text_channel(tmp_dir: tempfile::TempDir) {
        let saved = vec![3, 1, 2];
        let channel = write_channel::<TextCodec>(&tmp_dir, &saved);

        assert_eq!(fs::read_to_string(channel.path()).unwrap(), "3\n1\n2\n");
    }

    #[rstest]
    fn test_run_cursor_skips_malformed(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("channel");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(b"1\noops\n4\n8\n").unwrap();
        let channel = Channel {
            id: 3,
            len: fs::metadata(&path).unwrap().len(),
            path,
            items: 4,
        };

        let warnings = Warnings::new();
        let mut reader: ChannelReader<i64, TextCodec> = ChannelReader::new(&channel, None).unwrap();

        let first: Vec<i64> = reader.run(3, &warnings).map(Result::unwrap).collect();
        let second: Vec<i64> = reader.run(1, &warnings).map(Result::unwrap).collect();

        assert_eq!(first, vec![1, 4]);
        assert_eq!(second, vec![8]);

        let warnings = warnings.take();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].source, RecordSource::Channel(3));
        assert_eq!(warnings[0].record, "oops");
    }

    #[rstest]
    fn test_run_cursor_truncated_channel(tmp_dir: tempfile::TempDir) {
        let channel = write_channel::<RmpCodec>(&tmp_dir, &[1, 2]);
        let warnings = Warnings::new();
        let mut reader: ChannelReader<i64, RmpCodec> = ChannelReader::new(&channel, None).unwrap();

        let result: Vec<_> = reader.run(3, &warnings).collect();

        assert_eq!(result.len(), 3);
        assert!(result[0].is_ok() && result[1].is_ok());
        assert!(result[2].is_err());
    }
}

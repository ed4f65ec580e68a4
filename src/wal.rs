use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Change;

/// Upper bound on one encoded change. A length prefix above it can only come
/// from a corrupt tail.
const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

/// Frame one change as `[u32 len][bincode][u32 crc32]`, little-endian.
fn encode_change(writer: &mut impl Write, change: &Change) -> io::Result<()> {
    let payload =
        bincode::serialize(change).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_RECORD_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "WAL record too large"));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Outcome of reading one frame during replay.
enum Frame {
    Record(Change),
    /// Clean end of file.
    End,
    /// Torn or corrupt tail; everything from here on is discarded.
    Damaged(&'static str),
}

/// `Ok(false)` on EOF before the buffer is filled.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_frame(reader: &mut impl Read) -> io::Result<Frame> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(Frame::End);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_RECORD_LEN {
        return Ok(Frame::Damaged("record length exceeds maximum"));
    }
    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload)? {
        return Ok(Frame::Damaged("truncated payload"));
    }
    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(Frame::Damaged("truncated checksum"));
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Frame::Damaged("checksum mismatch"));
    }
    Ok(match bincode::deserialize::<Change>(&payload) {
        Ok(change) => Frame::Record(change),
        Err(_) => Frame::Damaged("undecodable record"),
    })
}

/// Append-only log of committed changes for one tenant.
///
/// A crash can leave at most a torn final record; replay detects it through
/// the length prefix and checksum and stops there.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    #[cfg(test)]
    pub fn append(&mut self, change: &Change) -> io::Result<()> {
        self.append_buffered(change)?;
        self.flush_sync()
    }

    /// Buffer a change. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, change: &Change) -> io::Result<()> {
        encode_change(&mut self.writer, change)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `changes` to the side file next to `path` and fsync it.
    pub fn write_compact_file(path: &Path, changes: &[Change]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_tmp_path(path))?);
        for change in changes {
            encode_change(&mut writer, change)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the side file over the live log and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, changes: &[Change]) -> io::Result<()> {
        Self::write_compact_file(&self.path, changes)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Every intact change in the log, in commit order. A missing file is an
    /// empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Change>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut changes = Vec::new();
        loop {
            match read_frame(&mut reader)? {
                Frame::Record(change) => changes.push(change),
                Frame::End => break,
                Frame::Damaged(reason) => {
                    warn!(
                        "{}: discarding WAL tail after {} records ({reason})",
                        path.display(),
                        changes.len()
                    );
                    break;
                }
            }
        }
        Ok(changes)
    }
}

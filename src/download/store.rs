//! On-disk piece store and final file assembly.
//!
//! Verified pieces are persisted one file each as `piece<index>.part`
//! under `<output>/<torrent name>/`. Assembly streams those files back out
//! into the final layout the metainfo describes and optionally removes the
//! piece files afterwards.
use crate::torrent::Metainfo;

use anyhow::{bail, Context, Result};
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

#[derive(Debug, Clone)]
pub struct PieceStore {
    /// The user-supplied output directory.
    root: PathBuf,
    /// `<root>/<info.name>`, where piece files accumulate.
    piece_dir: PathBuf,
}

impl PieceStore {
    pub fn new(output_dir: &Path, torrent_name: &str) -> Self {
        Self {
            root: output_dir.to_path_buf(),
            piece_dir: output_dir.join(torrent_name),
        }
    }

    pub fn piece_path(&self, index: u32) -> PathBuf {
        self.piece_dir.join(format!("piece{}.part", index))
    }

    /// Persists one verified piece, creating the piece directory on first
    /// use. The write goes through a temp file and a rename so a crash can
    /// not leave a truncated `.part` behind.
    pub async fn put(&self, index: u32, data: &[u8]) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.piece_dir).await?;
        let tmp = self.piece_dir.join(format!("piece{}.part.tmp", index));
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, self.piece_path(index)).await?;
        debug!(index, len = data.len(), "piece persisted");
        Ok(())
    }

    /**
    Assembles the final files out of the persisted pieces.

    # How it works:
    1. Requires every piece file `0..piece_count` to be present.
    2. Single-file mode: pieces are streamed in order into
       `<root>/<name>`. The piece directory occupies that exact path, so
       the content is staged next to it, the piece files and directory are
       removed, and the staged file takes the name.
    3. Multi-file mode: `info.files` is walked in declared order; a cursor
       over the piece sequence persists across file boundaries, so one
       file may span several pieces and one piece may feed several files.
       Each target gets exactly `length` bytes at
       `<root>/<name>/<joined path>`.
    4. With `delete_pieces`, the `.part` files are removed after success
       (single-file mode always consumes them, step 2).
    */
    #[instrument(skip(self, metainfo), level = "debug")]
    pub fn assemble(&self, metainfo: &Metainfo, delete_pieces: bool) -> Result<()> {
        let piece_count = metainfo.piece_count();
        for index in 0..piece_count {
            let path = self.piece_path(index as u32);
            if !path.exists() {
                bail!("piece file missing: {}", path.display());
            }
        }

        if metainfo.is_multi_file() {
            self.assemble_multi(metainfo)?;
            if delete_pieces {
                self.remove_pieces(piece_count)?;
            }
        } else {
            self.assemble_single(metainfo)?;
        }

        info!(files = metainfo.info.files.len().max(1), "assembly finished");
        Ok(())
    }

    fn assemble_single(&self, metainfo: &Metainfo) -> Result<()> {
        let staged = self.root.join(format!("{}.assembling", metainfo.info.name));
        {
            let mut out = BufWriter::new(
                File::create(&staged)
                    .with_context(|| format!("create {}", staged.display()))?,
            );
            let mut cursor = PieceCursor::new(self, metainfo.piece_count());
            cursor.copy_to(&mut out, metainfo.total_length() as u64)?;
            out.flush()?;
        }

        // the final file takes the piece directory's path
        self.remove_pieces(metainfo.piece_count())?;
        fs::remove_dir(&self.piece_dir)
            .with_context(|| format!("remove piece directory {}", self.piece_dir.display()))?;
        fs::rename(&staged, self.root.join(&metainfo.info.name))?;
        Ok(())
    }

    fn assemble_multi(&self, metainfo: &Metainfo) -> Result<()> {
        let mut cursor = PieceCursor::new(self, metainfo.piece_count());
        for entry in &metainfo.info.files {
            let mut target = self.piece_dir.clone();
            for component in &entry.path {
                target.push(component);
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }

            let mut out = BufWriter::new(
                File::create(&target)
                    .with_context(|| format!("create {}", target.display()))?,
            );
            cursor.copy_to(&mut out, entry.length as u64)?;
            out.flush()?;
            debug!(target = %target.display(), length = entry.length, "file written");
        }
        Ok(())
    }

    fn remove_pieces(&self, piece_count: usize) -> Result<()> {
        for index in 0..piece_count {
            fs::remove_file(self.piece_path(index as u32))?;
        }
        Ok(())
    }
}

/// A read cursor over the ordered piece files. State survives across
/// `copy_to` calls so consecutive files continue where the previous one
/// stopped inside a piece.
struct PieceCursor<'a> {
    store: &'a PieceStore,
    piece_count: usize,
    next_index: usize,
    current: Option<File>,
}

impl<'a> PieceCursor<'a> {
    fn new(store: &'a PieceStore, piece_count: usize) -> Self {
        Self {
            store,
            piece_count,
            next_index: 0,
            current: None,
        }
    }

    /// Copies exactly `remaining` bytes from the piece sequence into `out`.
    fn copy_to<W: Write>(&mut self, out: &mut W, mut remaining: u64) -> Result<()> {
        let mut buf = [0u8; 64 * 1024];
        while remaining > 0 {
            let mut file = match self.current.take() {
                Some(file) => file,
                None => {
                    if self.next_index >= self.piece_count {
                        bail!("piece data exhausted with {} bytes still owed", remaining);
                    }
                    let path = self.store.piece_path(self.next_index as u32);
                    self.next_index += 1;
                    File::open(&path).with_context(|| format!("open {}", path.display()))?
                }
            };

            let want = remaining.min(buf.len() as u64) as usize;
            let n = file.read(&mut buf[..want])?;
            if n == 0 {
                // this piece is drained; the next iteration opens the following one
                continue;
            }
            out.write_all(&buf[..n])?;
            remaining -= n as u64;
            self.current = Some(file);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::{FileEntry, InfoDict};

    fn metainfo_for(name: &str, piece_length: i64, pieces: usize, layout: Layout) -> Metainfo {
        let (length, files) = match layout {
            Layout::Single(len) => (Some(len), Vec::new()),
            Layout::Multi(files) => (None, files),
        };
        Metainfo {
            announce: String::new(),
            announce_list: Vec::new(),
            creation_date: None,
            comment: String::new(),
            created_by: String::new(),
            encoding: String::new(),
            info: InfoDict {
                name: name.to_string(),
                piece_length,
                pieces: vec![0u8; pieces * 20],
                private: false,
                length,
                files,
            },
            info_hash: [0u8; 20],
        }
    }

    enum Layout {
        Single(i64),
        Multi(Vec<FileEntry>),
    }

    async fn seed_pieces(store: &PieceStore, pieces: &[Vec<u8>]) {
        for (index, piece) in pieces.iter().enumerate() {
            store.put(index as u32, piece).await.unwrap();
        }
    }

    #[tokio::test]
    async fn put_writes_exact_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = PieceStore::new(dir.path(), "demo");
        store.put(0, &[1, 2, 3]).await.unwrap();
        let written = fs::read(store.piece_path(0)).unwrap();
        assert_eq!(written, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn single_file_assembly_concatenates_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let store = PieceStore::new(dir.path(), "file.bin");
        let pieces = vec![vec![0xaa; 16], vec![0xbb; 4]];
        seed_pieces(&store, &pieces).await;

        let metainfo = metainfo_for("file.bin", 16, 2, Layout::Single(20));
        store.assemble(&metainfo, true).unwrap();

        let out = fs::read(dir.path().join("file.bin")).unwrap();
        let mut expected = vec![0xaa; 16];
        expected.extend_from_slice(&[0xbb; 4]);
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn multi_file_assembly_splits_pieces_across_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = PieceStore::new(dir.path(), "dist");
        // 30 bytes of content, piece length 16: piece 0 is 0..16, piece 1 is 16..30
        let content: Vec<u8> = (0u8..30).collect();
        let pieces = vec![content[..16].to_vec(), content[16..].to_vec()];
        seed_pieces(&store, &pieces).await;

        let metainfo = metainfo_for(
            "dist",
            16,
            2,
            Layout::Multi(vec![
                FileEntry {
                    length: 10,
                    path: vec!["a".to_string()],
                },
                FileEntry {
                    length: 20,
                    path: vec!["sub".to_string(), "b".to_string()],
                },
            ]),
        );
        store.assemble(&metainfo, true).unwrap();

        let a = fs::read(dir.path().join("dist").join("a")).unwrap();
        let b = fs::read(dir.path().join("dist").join("sub").join("b")).unwrap();
        assert_eq!(a, content[..10]);
        assert_eq!(b, content[10..]);
        // spot-check the piece boundary inside `b`
        assert_eq!(b[5], pieces[0][15]);
        assert_eq!(b[6], pieces[1][0]);
        // piece files were consumed
        assert!(!store.piece_path(0).exists());
        assert!(!store.piece_path(1).exists());
    }

    #[tokio::test]
    async fn multi_file_assembly_can_keep_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let store = PieceStore::new(dir.path(), "dist");
        seed_pieces(&store, &[vec![9u8; 8]]).await;

        let metainfo = metainfo_for(
            "dist",
            8,
            1,
            Layout::Multi(vec![FileEntry {
                length: 8,
                path: vec!["only".to_string()],
            }]),
        );
        store.assemble(&metainfo, false).unwrap();
        assert!(store.piece_path(0).exists());
        assert!(dir.path().join("dist").join("only").exists());
    }

    #[tokio::test]
    async fn assembly_requires_every_piece() {
        let dir = tempfile::tempdir().unwrap();
        let store = PieceStore::new(dir.path(), "file.bin");
        seed_pieces(&store, &[vec![0u8; 16]]).await;

        let metainfo = metainfo_for("file.bin", 16, 2, Layout::Single(20));
        assert!(store.assemble(&metainfo, true).is_err());
    }
}

//! Torrent metainfo structure and parsing logic.
//!
//! The decoder walks the top-level dictionary with a [`Reader`] cursor,
//! records the exact byte span that encoded the `info` sub-dictionary, and
//! hashes that span for the info-hash. Bencoded representations of equal
//! dictionaries can differ bit-for-bit, so re-encoding the parsed value
//! would produce the wrong digest.
use crate::bencode::Reader;
use crate::torrent::{TorrentError, TorrentResult};

use sha1::{Digest, Sha1};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::instrument;

#[derive(Debug, PartialEq, Clone)]
pub struct Metainfo {
    pub announce: String,
    /// Fallback tracker URLs, flattened from `announce-list` tiers in
    /// declared order.
    pub announce_list: Vec<String>,
    pub creation_date: Option<SystemTime>,
    pub comment: String,
    pub created_by: String,
    pub encoding: String,
    pub info: InfoDict,
    pub info_hash: [u8; 20],
}

#[derive(Debug, PartialEq, Clone)]
pub struct InfoDict {
    pub name: String,
    pub piece_length: i64,
    /// Concatenation of 20-byte SHA-1 digests, one per piece.
    pub pieces: Vec<u8>,
    pub private: bool,
    /// Total length in single-file mode; `None` in multi-file mode.
    pub length: Option<i64>,
    pub files: Vec<FileEntry>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct FileEntry {
    pub length: i64,
    /// Path components, joined under `info.name`.
    pub path: Vec<String>,
}

impl Metainfo {
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read(path)?;
        Ok(Self::from_bytes(&data)?)
    }

    /**
    Decodes a .torrent buffer into a `Metainfo`.

    # How it works:
    1. Walks the top-level dictionary key by key; unknown keys are skipped
       in place with `skip_any`.
    2. For the `info` key, records the cursor before and after skipping the
       value, re-parses exactly that span into an `InfoDict`, and computes
       the SHA-1 digest of the span.
    3. Validates that the span is non-empty and that `pieces` is a positive
       multiple of 20 bytes.
    */
    #[instrument(skip(data), level = "debug")]
    pub fn from_bytes(data: &[u8]) -> TorrentResult<Self> {
        let mut r = Reader::new(data);
        r.expect_byte(b'd')?;

        let mut announce = String::new();
        let mut announce_list = Vec::new();
        let mut creation_date = None;
        let mut comment = String::new();
        let mut created_by = String::new();
        let mut encoding = String::new();
        let mut info = None;
        let mut info_span = (0usize, 0usize);

        loop {
            if r.peek()? == b'e' {
                r.read_byte()?;
                break;
            }

            let key = r.read_string()?.to_vec();
            match key.as_slice() {
                b"announce" => announce = read_utf8(&mut r, "announce")?,
                b"announce-list" => {
                    let tiers = r.read_string_list_of_lists()?;
                    announce_list = tiers.into_iter().flatten().collect();
                }
                b"creation date" => {
                    let secs = r.read_int()?;
                    let secs = u64::try_from(secs).map_err(|_| {
                        TorrentError::InvalidFormat("creation date before epoch".to_string())
                    })?;
                    creation_date = Some(UNIX_EPOCH + std::time::Duration::from_secs(secs));
                }
                b"comment" => comment = read_utf8(&mut r, "comment")?,
                b"created by" => created_by = read_utf8(&mut r, "created by")?,
                b"encoding" => encoding = read_utf8(&mut r, "encoding")?,
                b"info" => {
                    let start = r.position();
                    r.skip_any()?;
                    let end = r.position();
                    info_span = (start, end);

                    let mut sub = Reader::new(&data[start..end]);
                    info = Some(parse_info(&mut sub)?);
                }
                _ => r.skip_any()?,
            }
        }

        let info = info.ok_or(TorrentError::MissingField("info".to_string()))?;

        let (start, end) = info_span;
        if end <= start || end > data.len() {
            return Err(TorrentError::InvalidInfoSpan);
        }

        if info.pieces.is_empty() || info.pieces.len() % 20 != 0 {
            return Err(TorrentError::InvalidPiecesHashLength);
        }

        let mut hasher = Sha1::new();
        hasher.update(&data[start..end]);
        let info_hash: [u8; 20] = hasher.finalize().into();

        Ok(Metainfo {
            announce,
            announce_list,
            creation_date,
            comment,
            created_by,
            encoding,
            info,
            info_hash,
        })
    }

    /// Announce URLs in fallback order: the primary first, then every
    /// `announce-list` entry that is not a duplicate of the primary.
    pub fn announce_urls(&self) -> Vec<&str> {
        let mut urls = Vec::with_capacity(1 + self.announce_list.len());
        if !self.announce.is_empty() {
            urls.push(self.announce.as_str());
        }
        for url in &self.announce_list {
            if url != &self.announce {
                urls.push(url.as_str());
            }
        }
        urls
    }

    pub fn is_multi_file(&self) -> bool {
        !self.info.files.is_empty()
    }

    /// Sum of all file lengths.
    pub fn total_length(&self) -> i64 {
        if let Some(length) = self.info.length {
            length
        } else {
            self.info.files.iter().map(|f| f.length).sum()
        }
    }

    pub fn piece_count(&self) -> usize {
        self.info.pieces.len() / 20
    }

    /// The i-th 20-byte digest, a view into `info.pieces`.
    pub fn piece_hash(&self, index: usize) -> &[u8] {
        &self.info.pieces[index * 20..index * 20 + 20]
    }

    /**
    Returns the size of a specific piece.

    All pieces share `piece_length` except the last, which carries the
    remainder `total_length - (piece_count - 1) * piece_length`.
    */
    pub fn piece_size(&self, index: usize) -> i64 {
        if index >= self.piece_count() {
            return 0;
        }
        if index < self.piece_count() - 1 {
            self.info.piece_length
        } else {
            self.total_length() - (self.piece_count() as i64 - 1) * self.info.piece_length
        }
    }
}

fn read_utf8(r: &mut Reader<'_>, field: &str) -> TorrentResult<String> {
    let raw = r.read_string()?;
    String::from_utf8(raw.to_vec())
        .map_err(|e| TorrentError::InvalidFormat(format!("{} not UTF-8: {}", field, e)))
}

/// Parses the info dictionary from its own raw span.
fn parse_info(r: &mut Reader<'_>) -> TorrentResult<InfoDict> {
    r.expect_byte(b'd')?;

    let mut name = None;
    let mut piece_length = None;
    let mut pieces = Vec::new();
    let mut private = false;
    let mut length = None;
    let mut files = Vec::new();

    loop {
        if r.peek()? == b'e' {
            r.read_byte()?;
            break;
        }

        let key = r.read_string()?.to_vec();
        match key.as_slice() {
            b"name" => name = Some(read_utf8(r, "name")?),
            b"piece length" => piece_length = Some(r.read_int()?),
            b"pieces" => pieces = r.read_string()?.to_vec(),
            b"private" => private = r.read_int()? != 0,
            b"length" => length = Some(r.read_int()?),
            b"files" => files = parse_files(r)?,
            _ => r.skip_any()?,
        }
    }

    Ok(InfoDict {
        name: name.ok_or(TorrentError::MissingField("name".to_string()))?,
        piece_length: piece_length
            .ok_or(TorrentError::MissingField("piece length".to_string()))?,
        pieces,
        private,
        length,
        files,
    })
}

fn parse_files(r: &mut Reader<'_>) -> TorrentResult<Vec<FileEntry>> {
    r.expect_byte(b'l')?;
    let mut out = Vec::new();
    loop {
        if r.peek()? == b'e' {
            r.read_byte()?;
            break;
        }

        r.expect_byte(b'd')?;
        let mut length = None;
        let mut path = None;
        loop {
            if r.peek()? == b'e' {
                r.read_byte()?;
                break;
            }
            let key = r.read_string()?.to_vec();
            match key.as_slice() {
                b"length" => length = Some(r.read_int()?),
                b"path" => path = Some(r.read_string_list()?),
                _ => r.skip_any()?,
            }
        }
        out.push(FileEntry {
            length: length.ok_or(TorrentError::MissingField("file length".to_string()))?,
            path: path.ok_or(TorrentError::MissingField("file path".to_string()))?,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A minimal single-file torrent: two pieces of 16 KiB and 4 bytes.
    fn single_file_torrent() -> Vec<u8> {
        let mut pieces = vec![0xabu8; 20];
        pieces.extend_from_slice(&[0xcd; 20]);
        let mut data = Vec::new();
        data.extend_from_slice(b"d8:announce26:http://tracker.example/ann13:announce-listll26:http://tracker.example/annel25:udp://backup.example:6969ee7:comment4:test4:info");
        data.extend_from_slice(b"d6:lengthi16388e4:name8:file.bin12:piece lengthi16384e6:pieces40:");
        data.extend_from_slice(&pieces);
        data.extend_from_slice(b"ee");
        data
    }

    #[test]
    fn decodes_single_file_metainfo() {
        let data = single_file_torrent();
        let meta = Metainfo::from_bytes(&data).unwrap();
        assert_eq!(meta.announce, "http://tracker.example/ann");
        assert_eq!(meta.announce_list.len(), 2);
        assert_eq!(meta.comment, "test");
        assert_eq!(meta.info.name, "file.bin");
        assert_eq!(meta.info.piece_length, 16384);
        assert_eq!(meta.piece_count(), 2);
        assert_eq!(meta.total_length(), 16388);
        assert!(!meta.is_multi_file());
        assert_eq!(meta.piece_hash(0), &[0xab; 20]);
        assert_eq!(meta.piece_hash(1), &[0xcd; 20]);
    }

    #[test]
    fn info_hash_is_digest_of_exact_span() {
        let data = single_file_torrent();
        let meta = Metainfo::from_bytes(&data).unwrap();

        // locate the info value by hand: it starts right after the "4:info"
        // key and runs to the closing 'e' of the top-level dict
        let key = b"4:info";
        let start = data
            .windows(key.len())
            .position(|w| w == key)
            .unwrap()
            + key.len();
        let span = &data[start..data.len() - 1];

        let digest: [u8; 20] = Sha1::digest(span).into();
        assert_eq!(meta.info_hash, digest);
    }

    #[test]
    fn announce_urls_dedups_primary() {
        let data = single_file_torrent();
        let meta = Metainfo::from_bytes(&data).unwrap();
        assert_eq!(
            meta.announce_urls(),
            vec!["http://tracker.example/ann", "udp://backup.example:6969"]
        );
    }

    #[test]
    fn last_piece_carries_remainder() {
        let data = single_file_torrent();
        let meta = Metainfo::from_bytes(&data).unwrap();
        assert_eq!(meta.piece_size(0), 16384);
        assert_eq!(meta.piece_size(1), 4);
        assert_eq!(meta.piece_size(2), 0);
    }

    #[test]
    fn multi_file_lengths_sum() {
        let mut data = Vec::new();
        data.extend_from_slice(b"d8:announce26:http://tracker.example/ann4:info");
        data.extend_from_slice(b"d5:filesld6:lengthi10e4:pathl1:aeed6:lengthi20e4:pathl3:sub1:beee4:name4:dist12:piece lengthi16e6:pieces40:");
        data.extend_from_slice(&[0u8; 40]);
        data.extend_from_slice(b"ee");

        let meta = Metainfo::from_bytes(&data).unwrap();
        assert!(meta.is_multi_file());
        assert_eq!(meta.total_length(), 30);
        assert_eq!(meta.info.files[1].path, vec!["sub", "b"]);
        assert_eq!(meta.piece_size(1), 14);
    }

    #[test]
    fn rejects_ragged_pieces_field() {
        let mut data = Vec::new();
        data.extend_from_slice(b"d8:announce3:url4:info");
        data.extend_from_slice(b"d6:lengthi4e4:name1:x12:piece lengthi4e6:pieces19:");
        data.extend_from_slice(&[0u8; 19]);
        data.extend_from_slice(b"ee");
        assert!(matches!(
            Metainfo::from_bytes(&data),
            Err(TorrentError::InvalidPiecesHashLength)
        ));
    }

    #[test]
    fn unknown_keys_are_skipped() {
        let mut data = Vec::new();
        data.extend_from_slice(b"d8:announce3:url9:httpseedsl3:abce4:info");
        data.extend_from_slice(b"d6:lengthi4e4:name1:x7:privatei1e12:piece lengthi4e6:pieces20:");
        data.extend_from_slice(&[7u8; 20]);
        data.extend_from_slice(b"e10:when-makeri99ee");
        let meta = Metainfo::from_bytes(&data).unwrap();
        assert!(meta.info.private);
        assert_eq!(meta.piece_count(), 1);
    }
}

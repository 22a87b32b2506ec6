/// Cold-tier packfiles.
///
/// Evicted tiles are appended into large sequential files so the cold tier
/// holds a few big objects instead of millions of tiny ones. The layout is:
///
/// ```text
/// [payload][crc32] ... [payload][crc32] [manifest (bincode)] [footer]
/// ```
///
/// Each entry is the raw payload followed by its crc32. The manifest lists
/// every entry's tile id, offset, length, and crc; the fixed-size footer at
/// the end of the file records where the manifest lives and closes with the
/// magic `TSRPACK1`. A pack without a footer is still being written;
/// entries in it are readable because the cold index carries offsets
/// independently, and the manifest makes a sealed pack self-describing for
/// rebuilds.
///
/// Reads are a single range request: seek to the offset, read `len + 4`
/// bytes, verify the crc. Verification failures surface as `Corruption`
/// with the tile id, same as the warm tier.
use crate::error::{TesseraError, TesseraResult};
use crate::types::TileId;
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

/// Magic bytes closing every sealed packfile.
pub const PACK_MAGIC: [u8; 8] = *b"TSRPACK1";

/// Footer layout: manifest offset (u64) + manifest length (u64) +
/// manifest crc32 (u32) + magic (8 bytes).
pub const FOOTER_SIZE: u64 = 28;

/// Trailing crc stored after each payload.
const ENTRY_TRAILER: u64 = 4;

/// One entry in a pack manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackEntry {
    pub tile_id: TileId,
    pub offset: u64,
    pub len: u64,
    pub crc32: u32,
    /// Entry is a materialized full plane written in place of a tiny delta
    pub coalesced: bool,
}

/// Where a cold payload lives. Persisted in the catalog's cold index.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ColdLocation {
    pub pack_seq: u64,
    pub offset: u64,
    pub len: u64,
    pub crc32: u32,
    pub coalesced: bool,
}

/// File name for a pack sequence number.
pub fn pack_file_name(seq: u64) -> String {
    format!("pack-{seq:06}.pack")
}

/// Append-only writer for the pack currently being filled.
pub struct PackWriter {
    path: PathBuf,
    file: tokio::fs::File,
    entries: Vec<PackEntry>,
    written: u64,
    seq: u64,
}

impl PackWriter {
    /// Start a new pack under `dir` with the given sequence number.
    pub async fn create(dir: impl AsRef<Path>, seq: u64) -> TesseraResult<Self> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(pack_file_name(seq));
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file,
            entries: Vec::new(),
            written: 0,
            seq,
        })
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written so far, entries plus trailers.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Append one payload; returns its location for the cold index.
    pub async fn append(
        &mut self,
        tile_id: TileId,
        payload: &[u8],
        coalesced: bool,
    ) -> TesseraResult<ColdLocation> {
        let crc = crc32fast::hash(payload);
        let offset = self.written;
        self.file.write_all(payload).await?;
        self.file.write_all(&crc.to_le_bytes()).await?;
        self.file.flush().await?;
        self.written += payload.len() as u64 + ENTRY_TRAILER;
        self.entries.push(PackEntry {
            tile_id,
            offset,
            len: payload.len() as u64,
            crc32: crc,
            coalesced,
        });
        Ok(ColdLocation {
            pack_seq: self.seq,
            offset,
            len: payload.len() as u64,
            crc32: crc,
            coalesced,
        })
    }

    /// Write the manifest and footer, making the pack self-describing.
    pub async fn seal(mut self) -> TesseraResult<Vec<PackEntry>> {
        let manifest = bincode::serialize(&self.entries)?;
        let manifest_crc = crc32fast::hash(&manifest);
        self.file.write_all(&manifest).await?;
        self.file.write_all(&self.written.to_le_bytes()).await?;
        self.file
            .write_all(&(manifest.len() as u64).to_le_bytes())
            .await?;
        self.file.write_all(&manifest_crc.to_le_bytes()).await?;
        self.file.write_all(&PACK_MAGIC).await?;
        self.file.sync_all().await?;
        debug!(path = %self.path.display(), entries = self.entries.len(), "pack sealed");
        Ok(self.entries)
    }
}

/// Read one entry from a pack by location, verifying its crc.
pub async fn read_entry(
    path: impl AsRef<Path>,
    tile_id: &TileId,
    offset: u64,
    len: u64,
    expected_crc: u32,
) -> TesseraResult<Vec<u8>> {
    let mut file = tokio::fs::File::open(path.as_ref()).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; (len + ENTRY_TRAILER) as usize];
    file.read_exact(&mut buf).await?;

    let trailer = &buf[len as usize..];
    let stored_crc = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    buf.truncate(len as usize);

    let actual_crc = crc32fast::hash(&buf);
    if actual_crc != expected_crc || stored_crc != expected_crc {
        return Err(TesseraError::Corruption {
            tile_id: *tile_id,
            expected: format!("{expected_crc:08x}"),
            actual: format!("{actual_crc:08x}"),
        });
    }
    Ok(buf)
}

/// Read a sealed pack's manifest. Fails on missing or damaged footers.
pub async fn read_manifest(path: impl AsRef<Path>) -> TesseraResult<Vec<PackEntry>> {
    let path = path.as_ref();
    let mut file = tokio::fs::File::open(path).await?;
    let file_len = file.metadata().await?.len();
    if file_len < FOOTER_SIZE {
        return Err(TesseraError::Encoding(format!(
            "pack {} too short for a footer",
            path.display()
        )));
    }

    file.seek(SeekFrom::Start(file_len - FOOTER_SIZE)).await?;
    let mut footer = [0u8; FOOTER_SIZE as usize];
    file.read_exact(&mut footer).await?;

    if footer[20..28] != PACK_MAGIC {
        return Err(TesseraError::Encoding(format!(
            "pack {} has no trailing magic; unsealed or not a pack",
            path.display()
        )));
    }
    let manifest_offset = u64::from_le_bytes(footer[0..8].try_into().expect("8 bytes"));
    let manifest_len = u64::from_le_bytes(footer[8..16].try_into().expect("8 bytes"));
    let manifest_crc = u32::from_le_bytes(footer[16..20].try_into().expect("4 bytes"));

    if manifest_offset + manifest_len + FOOTER_SIZE != file_len {
        return Err(TesseraError::Encoding(format!(
            "pack {} footer does not line up with file size",
            path.display()
        )));
    }

    file.seek(SeekFrom::Start(manifest_offset)).await?;
    let mut manifest = vec![0u8; manifest_len as usize];
    file.read_exact(&mut manifest).await?;

    if crc32fast::hash(&manifest) != manifest_crc {
        return Err(TesseraError::Encoding(format!(
            "pack {} manifest crc mismatch",
            path.display()
        )));
    }
    Ok(bincode::deserialize(&manifest)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tid(n: u8) -> TileId {
        TileId::from_bytes([n; 32])
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let mut writer = PackWriter::create(dir.path(), 0).await.unwrap();

        let loc_a = writer.append(tid(1), b"alpha payload", false).await.unwrap();
        let loc_b = writer.append(tid(2), b"beta", true).await.unwrap();
        assert_eq!(loc_b.offset, b"alpha payload".len() as u64 + 4);

        let path = writer.path().to_path_buf();
        let got = read_entry(&path, &tid(1), loc_a.offset, loc_a.len, loc_a.crc32)
            .await
            .unwrap();
        assert_eq!(got, b"alpha payload");
        let got = read_entry(&path, &tid(2), loc_b.offset, loc_b.len, loc_b.crc32)
            .await
            .unwrap();
        assert_eq!(got, b"beta");
    }

    #[tokio::test]
    async fn test_seal_then_manifest_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut writer = PackWriter::create(dir.path(), 3).await.unwrap();
        writer.append(tid(1), b"one", false).await.unwrap();
        writer.append(tid(2), b"two", false).await.unwrap();
        let path = writer.path().to_path_buf();
        let entries = writer.seal().await.unwrap();
        assert_eq!(entries.len(), 2);

        let manifest = read_manifest(&path).await.unwrap();
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest[0].tile_id, tid(1));
        assert_eq!(manifest[1].tile_id, tid(2));

        // Entries stay readable after sealing
        let got = read_entry(
            &path,
            &manifest[1].tile_id,
            manifest[1].offset,
            manifest[1].len,
            manifest[1].crc32,
        )
        .await
        .unwrap();
        assert_eq!(got, b"two");
    }

    #[tokio::test]
    async fn test_corrupt_entry_detected() {
        let dir = TempDir::new().unwrap();
        let mut writer = PackWriter::create(dir.path(), 0).await.unwrap();
        let loc = writer.append(tid(7), b"precious bytes", false).await.unwrap();
        let path = writer.path().to_path_buf();

        // Flip one payload byte on disk
        let mut raw = tokio::fs::read(&path).await.unwrap();
        raw[2] ^= 0xFF;
        tokio::fs::write(&path, &raw).await.unwrap();

        match read_entry(&path, &tid(7), loc.offset, loc.len, loc.crc32).await {
            Err(TesseraError::Corruption { tile_id, .. }) => assert_eq!(tile_id, tid(7)),
            other => panic!("expected Corruption, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unsealed_pack_has_no_manifest() {
        let dir = TempDir::new().unwrap();
        let mut writer = PackWriter::create(dir.path(), 0).await.unwrap();
        writer.append(tid(1), b"data", false).await.unwrap();
        let path = writer.path().to_path_buf();
        drop(writer);

        assert!(matches!(
            read_manifest(&path).await,
            Err(TesseraError::Encoding(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_file_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.pack");
        tokio::fs::write(&path, b"").await.unwrap();
        assert!(read_manifest(&path).await.is_err());
    }
}

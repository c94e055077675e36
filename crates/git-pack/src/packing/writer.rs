//! §4.8 Writer — emits the write-ordered `PackingSet` as pack bytes.
//!
//! Structurally this is `crate::write::PackWriter` (placeholder header,
//! write entries, patch header and recompute the trailer hash at
//! `finish`) generalized with OfsDelta support, cached/recomputed delta
//! payloads, reused on-disk byte spans, and a pack-size limit that can
//! `Break` mid-stream.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use flate2::write::ZlibEncoder;
use flate2::Compression;
use git_hash::hasher::Hasher;
use git_hash::{HashAlgorithm, ObjectId};
use git_object::ObjectType;
use git_utils::progress::Progress;

use crate::entry::{encode_entry_header, encode_ofs_delta_offset};
use crate::{PackError, PACK_HEADER_SIZE, PACK_SIGNATURE, PACK_VERSION};

struct WrittenEntry {
    oid: ObjectId,
    offset: u64,
    crc32: u32,
}

/// Reference to a delta's base, in whichever form the entry carries it.
pub enum BaseRef {
    /// Base already written to this pack at `written_offset`; encoded as
    /// an OfsDelta back-offset relative to the new output position.
    Offset(u64),
    /// Base referenced by oid (thin/cross-pack delta), encoded as RefDelta.
    Oid(ObjectId),
}

/// Where an entry's bytes come from when it is time to emit it.
pub enum EntryPayload<'a> {
    /// Reuse the exact on-disk compressed delta bytes from a source pack
    /// (`copy_pack_data`). `uncompressed_size` is the size field already
    /// recorded for the in-pack representation.
    ReusedDelta {
        uncompressed_size: u64,
        base: BaseRef,
        compressed: &'a [u8],
    },
    /// Reuse the exact on-disk compressed non-delta bytes from a source
    /// pack.
    ReusedObject {
        obj_type: ObjectType,
        uncompressed_size: u64,
        compressed: &'a [u8],
    },
    /// A delta payload computed by `DeltaSearch` (cached or freshly
    /// diffed), not yet compressed.
    FreshDelta { base: BaseRef, uncompressed: &'a [u8] },
    /// The canonical (non-delta) bytes for the object, not yet compressed.
    FreshObject {
        obj_type: ObjectType,
        uncompressed: &'a [u8],
    },
}

/// Choose how to reference an already-placed base, honoring
/// `PackConfig::allow_ofs_delta` (§6): when disabled, always reference the
/// base by oid (RefDelta) even though it was written earlier in this same
/// pack and an OfsDelta back-offset would otherwise be available.
pub fn select_base_ref(base_offset: u64, base_oid: ObjectId, allow_ofs_delta: bool) -> BaseRef {
    if allow_ofs_delta {
        BaseRef::Offset(base_offset)
    } else {
        BaseRef::Oid(base_oid)
    }
}

/// Result of attempting to write one entry.
pub enum WriteOutcome {
    Written { offset: u64, crc32: u32 },
    /// The pack-size limit would be exceeded; caller should finish this
    /// pack and start a new one with the remaining entries.
    Break,
}

/// Streams a write-ordered `PackingSet` into a `.pack` file plus its `.idx`.
pub struct Writer {
    file: std::fs::File,
    path: PathBuf,
    position: u64,
    num_objects: u32,
    entries: Vec<WrittenEntry>,
    compression_level: u32,
    pack_size_limit: u64,
    progress: Option<Progress>,
}

impl Writer {
    pub fn new(path: impl AsRef<Path>, compression_level: u32, pack_size_limit: u64) -> Result<Self, PackError> {
        let path = path.as_ref().to_path_buf();
        let mut file = std::fs::File::create(&path)?;

        let mut header = [0u8; PACK_HEADER_SIZE];
        header[0..4].copy_from_slice(PACK_SIGNATURE);
        header[4..8].copy_from_slice(&PACK_VERSION.to_be_bytes());
        header[8..12].copy_from_slice(&0u32.to_be_bytes());
        file.write_all(&header)?;

        Ok(Self {
            file,
            path,
            position: PACK_HEADER_SIZE as u64,
            num_objects: 0,
            entries: Vec::new(),
            compression_level: compression_level.min(9),
            pack_size_limit,
            progress: None,
        })
    }

    /// Enable the "Writing objects" progress phase (§9 supplemented
    /// feature). `total` is the number of entries expected to be written.
    pub fn with_progress(mut self, enabled: bool, total: Option<u64>) -> Self {
        if enabled {
            self.progress = Some(Progress::new("Writing objects", total));
        }
        self
    }

    /// Splice raw bytes from an existing pack directly after the header
    /// (the "reused-pack prefix" bitmap fast path, §4.8). Caller supplies
    /// the entries this prefix covers so they land in the index too.
    pub fn splice_reused_prefix(&mut self, bytes: &[u8], covers: &[(ObjectId, u64, u32)]) -> Result<(), PackError> {
        let base_offset = self.position;
        self.write_bytes(bytes)?;
        for &(oid, relative_offset, crc32) in covers {
            self.entries.push(WrittenEntry {
                oid,
                offset: base_offset + relative_offset,
                crc32,
            });
            self.num_objects += 1;
        }
        Ok(())
    }

    /// Write one entry. Returns `Break` without mutating state further if
    /// doing so would exceed `pack_size_limit`.
    pub fn write_entry(&mut self, oid: ObjectId, payload: EntryPayload<'_>) -> Result<WriteOutcome, PackError> {
        let estimated_len = match &payload {
            EntryPayload::ReusedDelta { compressed, .. } => compressed.len() as u64 + 32,
            EntryPayload::ReusedObject { compressed, .. } => compressed.len() as u64,
            EntryPayload::FreshDelta { uncompressed, .. } => uncompressed.len() as u64,
            EntryPayload::FreshObject { uncompressed, .. } => uncompressed.len() as u64,
        };
        if self.pack_size_limit != 0 && self.position + estimated_len > self.pack_size_limit && self.num_objects > 0
        {
            return Ok(WriteOutcome::Break);
        }

        let (offset, crc32) = match payload {
            EntryPayload::ReusedDelta {
                uncompressed_size,
                base,
                compressed,
            } => self.emit(7, uncompressed_size, Some(base), compressed, true)?,
            EntryPayload::ReusedObject {
                obj_type,
                uncompressed_size,
                compressed,
            } => self.emit(type_num(obj_type), uncompressed_size, None, compressed, true)?,
            EntryPayload::FreshDelta { base, uncompressed } => {
                self.emit(7, uncompressed.len() as u64, Some(base), uncompressed, false)?
            }
            EntryPayload::FreshObject { obj_type, uncompressed } => {
                self.emit(type_num(obj_type), uncompressed.len() as u64, None, uncompressed, false)?
            }
        };

        self.entries.push(WrittenEntry { oid, offset, crc32 });
        self.num_objects += 1;
        if let Some(progress) = &mut self.progress {
            progress.update(self.num_objects as u64);
        }
        Ok(WriteOutcome::Written { offset, crc32 })
    }

    /// Write one entry's header, optional base reference, and payload.
    /// `payload` is either already-compressed bytes (`already_compressed`)
    /// or raw bytes to deflate now.
    fn emit(
        &mut self,
        entry_type_num: u8,
        uncompressed_size: u64,
        base: Option<BaseRef>,
        payload: &[u8],
        already_compressed: bool,
    ) -> Result<(u64, u32), PackError> {
        let entry_offset = self.position;
        let mut header = encode_entry_header(entry_type_num, uncompressed_size);

        let base_bytes: Vec<u8> = match &base {
            Some(BaseRef::Offset(base_written_offset)) => {
                encode_ofs_delta_offset(entry_offset - base_written_offset)
            }
            Some(BaseRef::Oid(oid)) => oid.as_bytes().to_vec(),
            None => Vec::new(),
        };
        // RefDelta base oids make the entry type 7 regardless of how the
        // caller tagged it; OfsDelta bases keep type 6.
        if matches!(base, Some(BaseRef::Offset(_))) {
            header = encode_entry_header(6, uncompressed_size);
        }

        let compressed: Vec<u8>;
        let body: &[u8] = if already_compressed {
            payload
        } else {
            let mut buf = Vec::new();
            {
                let mut encoder = ZlibEncoder::new(&mut buf, Compression::new(self.compression_level));
                encoder.write_all(payload)?;
                encoder.finish()?;
            }
            compressed = buf;
            &compressed
        };

        let mut crc = crc32fast::Hasher::new();
        crc.update(&header);
        crc.update(&base_bytes);
        crc.update(body);
        let crc_val = crc.finalize();

        self.write_bytes(&header)?;
        self.write_bytes(&base_bytes)?;
        self.write_bytes(body)?;

        Ok((entry_offset, crc_val))
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<(), PackError> {
        self.file.write_all(data)?;
        self.position += data.len() as u64;
        Ok(())
    }

    /// Patch the header with the real object count, append the trailing
    /// hash, and rename to `pack-<hash>.pack`.
    pub fn finalize(mut self) -> Result<(PathBuf, ObjectId, Vec<(ObjectId, u64, u32)>), PackError> {
        if let Some(progress) = self.progress.take() {
            progress.finish();
        }
        use std::io::Seek;
        self.file.seek(std::io::SeekFrom::Start(0))?;
        let mut header = [0u8; PACK_HEADER_SIZE];
        header[0..4].copy_from_slice(PACK_SIGNATURE);
        header[4..8].copy_from_slice(&PACK_VERSION.to_be_bytes());
        header[8..12].copy_from_slice(&self.num_objects.to_be_bytes());
        self.file.write_all(&header)?;
        self.file.flush()?;
        drop(self.file);

        let content = std::fs::read(&self.path)?;
        let mut hasher = Hasher::new(HashAlgorithm::Sha1);
        hasher.update(&content);
        let checksum = hasher.finalize().map_err(PackError::Hash)?;

        let mut file = std::fs::OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(checksum.as_bytes())?;
        drop(file);

        let final_path = self.path.with_file_name(format!("pack-{}.pack", checksum.to_hex()));
        std::fs::rename(&self.path, &final_path)?;

        let entries = self.entries.iter().map(|e| (e.oid, e.offset, e.crc32)).collect();
        Ok((final_path, checksum, entries))
    }

    pub fn object_count(&self) -> u32 {
        self.num_objects
    }
}

fn type_num(t: ObjectType) -> u8 {
    match t {
        ObjectType::Commit => 1,
        ObjectType::Tree => 2,
        ObjectType::Blob => 3,
        ObjectType::Tag => 4,
    }
}

/// Adjust the mtimes of a set of packs written in one multi-pack run so
/// their filesystem order matches write order, per §4.8's finalization
/// note ("adjust pack mtimes so that older packs ... are preserved in
/// mtime order").
pub fn preserve_mtime_order(paths: &[PathBuf]) -> std::io::Result<()> {
    let now = std::time::SystemTime::now();
    for (i, path) in paths.iter().enumerate() {
        let offset = std::time::Duration::from_secs((paths.len() - i) as u64);
        let mtime = now.checked_sub(offset).unwrap_or(now);
        let file = std::fs::OpenOptions::new().write(true).open(path)?;
        file.set_modified(mtime)?;
    }
    Ok(())
}

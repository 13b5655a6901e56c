//! Content-addressed blob storage in the OCI directory layout:
//! `oci-layout`, `index.json`, and `blobs/sha256/<hex>`.

use std::fmt::Debug;
use std::io::{Read, Write};

use anyhow::{Context, Result};
use cap_std_ext::cap_std::fs::{Dir, File};
use cap_std_ext::dirext::CapStdExtDirExt;
use flate2::write::GzEncoder;
use fn_error_context::context;
use openssl::hash::{Hasher, MessageDigest};
use serde::{Deserialize, Serialize};

use crate::digest::{sha256_of_bytes, Digest, Sha256Writer, SHA256_HEXLEN};
use crate::errors::Error;
use crate::oci::{Descriptor, Index, OCI_TYPE_LAYER_GZIP};

/// Path inside the layout to the blobs.
const BLOBDIR: &str = "blobs/sha256";
const LAYOUT_FILE: &str = "oci-layout";
const INDEX_FILE: &str = "index.json";
const LAYOUT_VERSION: &str = "1.0.0";

#[derive(Debug, Serialize, Deserialize)]
struct OciLayout {
    #[serde(rename = "imageLayoutVersion")]
    version: String,
}

/// A content-addressed store rooted at a directory file descriptor.
///
/// Blob placement is atomic: bytes land in a uniquely named temporary in
/// `blobs/sha256/` and are hard-linked to their final hex name, so a blob is
/// either absent or fully present under its digest. Concurrent writers of
/// the same content race harmlessly on the link.
#[derive(Debug)]
pub struct BlobDir {
    dir: Dir,
    writable: bool,
}

impl BlobDir {
    /// Open an existing layout, or (when `writable`) initialize a fresh one.
    ///
    /// A present `oci-layout` with any version other than 1.0.0 fails with
    /// not-supported and is never overwritten.
    #[context("Opening OCI layout")]
    pub fn open(dir: Dir, writable: bool) -> Result<Self> {
        match dir.open_optional(LAYOUT_FILE)? {
            Some(mut f) => {
                let mut buf = String::new();
                f.read_to_string(&mut buf)?;
                let layout: OciLayout =
                    serde_json::from_str(&buf).context("Parsing oci-layout")?;
                if layout.version != LAYOUT_VERSION {
                    return Err(Error::NotSupported(format!(
                        "oci-layout version {}",
                        layout.version
                    ))
                    .into());
                }
            }
            None if writable => {
                dir.create_dir_all(BLOBDIR)?;
                let layout = serde_json::to_vec(&OciLayout {
                    version: LAYOUT_VERSION.into(),
                })?;
                dir.atomic_write(LAYOUT_FILE, layout)?;
            }
            None => {
                return Err(Error::NotFound("oci-layout".into()).into());
            }
        }
        Ok(Self { dir, writable })
    }

    /// The underlying directory.
    pub fn dir(&self) -> &Dir {
        &self.dir
    }

    /// A second handle to the same store, e.g. for a worker task.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            dir: self.dir.try_clone()?,
            writable: self.writable,
        })
    }

    fn require_writable(&self) -> Result<()> {
        if !self.writable {
            return Err(Error::NotSupported("write to read-only store".into()).into());
        }
        Ok(())
    }

    fn blob_path(digest: &Digest) -> String {
        format!("{BLOBDIR}/{}", digest.sha256_hex())
    }

    fn temp_path() -> String {
        format!("{BLOBDIR}/.tmp-{}", uuid::Uuid::new_v4())
    }

    /// Whether the addressed blob is present.
    pub fn contains(&self, digest: &Digest) -> Result<bool> {
        Ok(self.dir.try_exists(Self::blob_path(digest))?)
    }

    /// Open the addressed blob for reading, returning the stream and size.
    ///
    /// This does not verify content; typed loads that parse the bytes
    /// re-digest them.
    #[context("Opening blob {digest}")]
    pub fn open_blob(&self, digest: &Digest) -> Result<(File, u64)> {
        let path = Self::blob_path(digest);
        if !self.dir.try_exists(&path)? {
            return Err(Error::NotFound(digest.to_string()).into());
        }
        let f = self.dir.open(&path)?;
        let size = f.metadata()?.len();
        Ok((f, size))
    }

    /// Read the addressed blob fully, verifying its content digest.
    #[context("Reading blob {digest}")]
    pub fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>> {
        let (mut f, _) = self.open_blob(digest)?;
        let mut buf = Vec::new();
        f.read_to_end(&mut buf)?;
        let actual = sha256_of_bytes(&buf)?;
        if actual != *digest {
            return Err(Error::Corrupted(format!("{digest} has content {actual}")).into());
        }
        Ok(buf)
    }

    /// Store a byte string, returning its digest. A pre-existing blob with
    /// the same content is success.
    #[context("Storing blob")]
    pub fn store_bytes(&self, buf: &[u8]) -> Result<Digest> {
        self.require_writable()?;
        let digest = sha256_of_bytes(buf)?;
        if self.contains(&digest)? {
            return Ok(digest);
        }
        let tmp = Self::temp_path();
        self.dir.write(&tmp, buf)?;
        self.link_temp(&tmp, &digest)?;
        Ok(digest)
    }

    /// Serialize a value as canonical JSON and store it, returning the
    /// digest and the exact stored bytes.
    pub fn store_json<S: Serialize>(&self, v: &S) -> Result<(Digest, Vec<u8>)> {
        let buf = to_canonical_json(v)?;
        let digest = self.store_bytes(&buf)?;
        Ok((digest, buf))
    }

    /// Hard-link a temporary into its final content address. An existing
    /// final path is success; the temporary is always removed.
    fn link_temp(&self, tmp: &str, digest: &Digest) -> Result<()> {
        let target = Self::blob_path(digest);
        let r = self.dir.hard_link(tmp, &self.dir, &target);
        let cleanup = self.dir.remove_file(tmp);
        match r {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e).context("Linking blob into place"),
        }
        cleanup.context("Removing blob temporary")?;
        Ok(())
    }

    /// Stream a blob with a known digest into the store, verifying on the
    /// fly; a mismatch deletes the temporary and fails with corruption.
    /// Returns the byte count (0 when the blob was already present).
    #[context("Storing blob {expected}")]
    pub fn store_from_reader(&self, expected: &Digest, mut r: impl Read) -> Result<u64> {
        self.require_writable()?;
        if self.contains(expected)? {
            return Ok(0);
        }
        let tmp = Self::temp_path();
        let f = self.dir.create(&tmp)?;
        let mut w = Sha256Writer::new(f)?;
        if let Err(e) = std::io::copy(&mut r, &mut w) {
            let _ = self.dir.remove_file(&tmp);
            return Err(e.into());
        }
        let (actual, size, f) = w.finish()?;
        drop(f);
        if actual != *expected {
            self.dir.remove_file(&tmp)?;
            return Err(Error::Corrupted(format!("{expected} has content {actual}")).into());
        }
        self.link_temp(&tmp, expected)?;
        Ok(size)
    }

    /// Stream bytes of unknown digest into the store, returning the computed
    /// digest and byte count.
    #[context("Storing blob stream")]
    pub fn store_reader(&self, mut r: impl Read) -> Result<(Digest, u64)> {
        self.require_writable()?;
        let tmp = Self::temp_path();
        let f = self.dir.create(&tmp)?;
        let mut w = Sha256Writer::new(f)?;
        if let Err(e) = std::io::copy(&mut r, &mut w) {
            let _ = self.dir.remove_file(&tmp);
            return Err(e.into());
        }
        let (digest, size, f) = w.finish()?;
        drop(f);
        self.link_temp(&tmp, &digest)?;
        Ok((digest, size))
    }

    /// Copy the addressed blob into `w`, verifying content against the
    /// digest on the way through.
    #[context("Reading blob {digest}")]
    pub fn read_blob_to(&self, digest: &Digest, w: impl Write) -> Result<u64> {
        let (mut f, _) = self.open_blob(digest)?;
        let mut w = Sha256Writer::new(w)?;
        std::io::copy(&mut f, &mut w)?;
        let (actual, size, _) = w.finish()?;
        if actual != *digest {
            return Err(Error::Corrupted(format!("{digest} has content {actual}")).into());
        }
        Ok(size)
    }

    /// Begin streaming a new gzip-compressed layer.
    pub fn layer_writer(&self) -> Result<LayerWriter<'_>> {
        self.require_writable()?;
        LayerWriter::new(self)
    }

    /// Load `index.json`; absent is an empty index.
    #[context("Loading index")]
    pub fn load_index(&self) -> Result<Index> {
        match self.dir.open_optional(INDEX_FILE)? {
            Some(mut f) => {
                let mut buf = Vec::new();
                f.read_to_end(&mut buf)?;
                serde_json::from_slice(&buf).context("Parsing index.json")
            }
            None => Ok(Index::default()),
        }
    }

    /// Atomically replace `index.json`.
    #[context("Saving index")]
    pub fn save_index(&self, index: &Index) -> Result<()> {
        self.require_writable()?;
        let buf = to_canonical_json(index)?;
        self.dir.atomic_write(INDEX_FILE, buf)?;
        Ok(())
    }

    /// Enumerate all stored blob digests.
    pub fn list_blobs(&self) -> Result<Vec<Digest>> {
        let mut r = Vec::new();
        for ent in self.dir.read_dir(BLOBDIR)? {
            let ent = ent?;
            let name = ent.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.len() != SHA256_HEXLEN {
                // Stale temporaries from an interrupted writer also land
                // here; they are swept by prune.
                continue;
            }
            if let Ok(d) = Digest::from_sha256_hex(name) {
                r.push(d);
            }
        }
        r.sort();
        Ok(r)
    }

    /// Remove the addressed blob; absent is success.
    pub fn delete_blob(&self, digest: &Digest) -> Result<()> {
        self.require_writable()?;
        match self.dir.remove_file(Self::blob_path(digest)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove temporaries left over from interrupted writers.
    pub fn sweep_temporaries(&self) -> Result<u64> {
        self.require_writable()?;
        let mut n = 0;
        for ent in self.dir.read_dir(BLOBDIR)? {
            let ent = ent?;
            let name = ent.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(".tmp-") {
                self.dir.remove_file(format!("{BLOBDIR}/{name}"))?;
                n += 1;
            }
        }
        Ok(n)
    }
}

/// Serialize a value with canonical (sorted, minimal) JSON formatting so
/// the result has a stable digest.
pub fn to_canonical_json<S: Serialize>(v: &S) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut ser =
        serde_json::Serializer::with_formatter(&mut buf, olpc_cjson::CanonicalFormatter::new());
    v.serialize(&mut ser).context("Serializing canonical JSON")?;
    Ok(buf)
}

/// Streaming writer for a new layer blob.
///
/// Accepts uncompressed tar bytes; the store receives the gzip-compressed
/// stream. Both the compressed digest (what manifests reference) and the
/// uncompressed diff-id (what image configs reference) are maintained on
/// the fly. Dropping without [`LayerWriter::complete`] unlinks the
/// temporary.
pub struct LayerWriter<'a> {
    store: &'a BlobDir,
    tmpname: Option<String>,
    compressor: Option<GzEncoder<Sha256Writer<File>>>,
    uncompressed_hash: Hasher,
    uncompressed_size: u64,
}

impl<'a> Debug for LayerWriter<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerWriter")
            .field("tmpname", &self.tmpname)
            .field("uncompressed_size", &self.uncompressed_size)
            .finish()
    }
}

impl<'a> LayerWriter<'a> {
    fn new(store: &'a BlobDir) -> Result<Self> {
        let tmpname = BlobDir::temp_path();
        let f = store.dir.create(&tmpname)?;
        let target = Sha256Writer::new(f)?;
        Ok(Self {
            store,
            tmpname: Some(tmpname),
            compressor: Some(GzEncoder::new(target, flate2::Compression::default())),
            uncompressed_hash: Hasher::new(MessageDigest::sha256())?,
            uncompressed_size: 0,
        })
    }

    /// Finalize both digests and link the blob into the store. Returns the
    /// uncompressed diff-id and a layer descriptor for the compressed blob.
    #[context("Completing layer")]
    pub fn complete(mut self) -> Result<(Digest, Descriptor)> {
        let compressor = self.compressor.take().expect("layer not yet completed");
        let target = compressor.finish()?;
        let (digest, size, mut f) = target.finish()?;
        f.flush()?;
        drop(f);
        let tmpname = self.tmpname.take().expect("layer temp present");
        self.store.link_temp(&tmpname, &digest)?;
        let diff_id = Digest::from_sha256_hex(&hex::encode(self.uncompressed_hash.finish()?))?;
        Ok((
            diff_id,
            Descriptor {
                media_type: OCI_TYPE_LAYER_GZIP.into(),
                digest,
                size,
                platform: None,
                annotations: None,
            },
        ))
    }
}

impl<'a> Write for LayerWriter<'a> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.uncompressed_hash.update(buf)?;
        self.uncompressed_size += buf.len() as u64;
        self.compressor
            .as_mut()
            .expect("layer not yet completed")
            .write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> Drop for LayerWriter<'a> {
    fn drop(&mut self) {
        // An error mid-stream must not leave a partial name visible.
        if let Some(tmpname) = self.tmpname.take() {
            drop(self.compressor.take());
            if let Err(e) = self.store.dir.remove_file(&tmpname) {
                tracing::debug!("failed to remove layer temporary: {e}");
            }
        }
    }
}

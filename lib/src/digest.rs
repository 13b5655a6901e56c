//! SHA-256 content digests and rolling hashers.

use std::fmt::{Debug, Display};
use std::io::{Read, Write};

use anyhow::Result;
use openssl::hash::{Hasher, MessageDigest};
use serde::{Deserialize, Serialize};

use crate::errors::Error;

const SHA256_PREFIX: &str = "sha256:";
/// Length of a lowercase hex encoded SHA-256.
pub const SHA256_HEXLEN: usize = 64;

/// A tagged content digest, normalized to `sha256:<64 lowercase hex>`.
///
/// The only supported algorithm is sha256; parsing anything else fails with
/// a not-supported kind so callers can distinguish "new algorithm" from
/// garbage input.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(Box<str>);

impl Digest {
    /// Parse and normalize a `<algo>:<hex>` digest string.
    pub fn parse(s: &str) -> Result<Self> {
        let (algo, hex) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidArgument(format!("digest without algorithm: {s:?}")))?;
        if algo != "sha256" {
            return Err(Error::NotSupported(format!("digest algorithm {algo}")).into());
        }
        Self::from_sha256_hex(hex)
    }

    /// Build a digest from a bare 64-character hex payload.
    pub fn from_sha256_hex(hex: &str) -> Result<Self> {
        if hex.len() != SHA256_HEXLEN
            || !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        {
            return Err(Error::InvalidArgument(format!("invalid sha256 hex: {hex:?}")).into());
        }
        Ok(Self(format!("{SHA256_PREFIX}{hex}").into()))
    }

    /// The full normalized `sha256:<hex>` form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The bare hex payload.
    pub fn sha256_hex(&self) -> &str {
        &self.0[SHA256_PREFIX.len()..]
    }

    /// The raw 32 digest bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        hex::decode(self.sha256_hex()).expect("validated hex")
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Digest {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> String {
        d.0.into()
    }
}

/// A rolling SHA-256 over everything written through to the inner writer.
pub struct Sha256Writer<W: Write> {
    hash: Hasher,
    inner: W,
    len: u64,
}

impl<W: Write> Debug for Sha256Writer<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sha256Writer").field("len", &self.len).finish()
    }
}

impl<W: Write> Sha256Writer<W> {
    /// Wrap a writer.
    pub fn new(inner: W) -> Result<Self> {
        Ok(Self {
            hash: Hasher::new(MessageDigest::sha256())?,
            inner,
            len: 0,
        })
    }

    /// Finalize, returning the digest, the byte count, and the inner writer.
    pub fn finish(mut self) -> Result<(Digest, u64, W)> {
        let digest = Digest::from_sha256_hex(&hex::encode(self.hash.finish()?))?;
        Ok((digest, self.len, self.inner))
    }
}

impl<W: Write> Write for Sha256Writer<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hash.update(&buf[..n])?;
        self.len += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// A rolling SHA-256 over everything read through from the inner reader.
pub struct Sha256Reader<R: Read> {
    hash: Hasher,
    inner: R,
    len: u64,
}

impl<R: Read> Debug for Sha256Reader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sha256Reader").field("len", &self.len).finish()
    }
}

impl<R: Read> Sha256Reader<R> {
    /// Wrap a reader.
    pub fn new(inner: R) -> Result<Self> {
        Ok(Self {
            hash: Hasher::new(MessageDigest::sha256())?,
            inner,
            len: 0,
        })
    }

    /// Finalize, returning the digest and the byte count.
    pub fn finish(mut self) -> Result<(Digest, u64)> {
        let digest = Digest::from_sha256_hex(&hex::encode(self.hash.finish()?))?;
        Ok((digest, self.len))
    }
}

impl<R: Read> Read for Sha256Reader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hash.update(&buf[..n])?;
        self.len += n as u64;
        Ok(n)
    }
}

/// Digest of an in-memory byte string.
pub fn sha256_of_bytes(buf: &[u8]) -> Result<Digest> {
    let d = openssl::hash::hash(MessageDigest::sha256(), buf)?;
    Digest::from_sha256_hex(&hex::encode(d.as_ref()))
}

/// Digest and length of everything readable from `r`.
pub fn sha256_of_reader(mut r: impl Read) -> Result<(Digest, u64)> {
    let mut hash = Hasher::new(MessageDigest::sha256())?;
    let mut len = 0u64;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hash.update(&buf[..n])?;
        len += n as u64;
    }
    let digest = Digest::from_sha256_hex(&hex::encode(hash.finish()?))?;
    Ok((digest, len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::error_kind;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn parse_and_display() {
        let d = Digest::parse(&format!("sha256:{EMPTY_SHA256}")).unwrap();
        assert_eq!(d.sha256_hex(), EMPTY_SHA256);
        assert_eq!(d.to_string(), format!("sha256:{EMPTY_SHA256}"));
        assert_eq!(d.to_bytes().len(), 32);
    }

    #[test]
    fn parse_rejects() {
        // Unknown algorithm is not-supported, not invalid
        let e = Digest::parse(&format!("sha512:{EMPTY_SHA256}")).unwrap_err();
        assert!(matches!(error_kind(&e), Some(Error::NotSupported(_))));
        for bad in [
            "",
            "sha256:",
            "sha256:abc",
            // uppercase hex is rejected; equality is byte-exact on the normalized form
            &format!("sha256:{}", EMPTY_SHA256.to_uppercase()),
            &format!("sha256:{}x", &EMPTY_SHA256[..63]),
            EMPTY_SHA256,
        ] {
            let e = Digest::parse(bad).unwrap_err();
            assert!(
                matches!(error_kind(&e), Some(Error::InvalidArgument(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn hash_bytes_and_reader_agree() {
        let body = b"hello world";
        let d1 = sha256_of_bytes(body).unwrap();
        let (d2, n) = sha256_of_reader(&body[..]).unwrap();
        assert_eq!(d1, d2);
        assert_eq!(n, body.len() as u64);
        assert_eq!(
            d1.sha256_hex(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn writer_matches_oneshot() {
        let mut w = Sha256Writer::new(Vec::new()).unwrap();
        w.write_all(b"hello ").unwrap();
        w.write_all(b"world").unwrap();
        let (d, n, inner) = w.finish().unwrap();
        assert_eq!(n, 11);
        assert_eq!(inner, b"hello world");
        assert_eq!(d, sha256_of_bytes(b"hello world").unwrap());
    }

    #[test]
    fn serde_roundtrip() {
        let d = sha256_of_bytes(b"x").unwrap();
        let j = serde_json::to_string(&d).unwrap();
        assert_eq!(j, format!("\"{d}\""));
        let back: Digest = serde_json::from_str(&j).unwrap();
        assert_eq!(back, d);
        assert!(serde_json::from_str::<Digest>("\"md5:abcd\"").is_err());
    }

    quickcheck::quickcheck! {
        fn roundtrip_arbitrary_content(data: Vec<u8>) -> bool {
            let d = sha256_of_bytes(&data).unwrap();
            Digest::parse(d.as_str()).unwrap() == d
        }
    }
}

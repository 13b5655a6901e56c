//! OpenPGP signing and verification of image signature payloads.
//!
//! We drive a `gpg` subprocess rather than linking a crypto engine; the
//! engine home is always explicit. Verification never touches the caller's
//! keyring: the remote's trusted keys are imported into a freshly created
//! temporary home which is discarded afterwards.

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use sandpak_utils::CommandRunExt;
use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::errors::Error;

/// The `critical.type` value every signature payload must carry.
pub const SIGNATURE_TYPE: &str = "atomic container signature";

/// `critical.identity` member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureIdentity {
    /// The fully qualified remote ref this signature vouches for.
    #[serde(rename = "docker-reference")]
    pub reference: String,
}

/// `critical.image` member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureImage {
    /// The manifest digest being signed.
    #[serde(rename = "docker-manifest-digest")]
    pub manifest_digest: Digest,
}

/// The covered (signature-relevant) part of the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureCritical {
    /// Payload type tag; must equal [`SIGNATURE_TYPE`].
    #[serde(rename = "type")]
    pub kind: String,
    /// What is signed.
    pub image: SignatureImage,
    /// Who it is for.
    pub identity: SignatureIdentity,
}

/// The signature JSON object carried inside an OpenPGP signed message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureJson {
    /// Covered content.
    pub critical: SignatureCritical,
    /// Uncovered annotations (creator, timestamp, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub optional: BTreeMap<String, serde_json::Value>,
}

impl SignatureJson {
    /// Build a payload binding `reference` to `manifest_digest`.
    pub fn new(reference: &str, manifest_digest: &Digest) -> Self {
        Self {
            critical: SignatureCritical {
                kind: SIGNATURE_TYPE.into(),
                image: SignatureImage {
                    manifest_digest: manifest_digest.clone(),
                },
                identity: SignatureIdentity {
                    reference: reference.into(),
                },
            },
            optional: BTreeMap::new(),
        }
    }
}

fn gpg_command(homedir: Option<&Utf8Path>) -> Command {
    let mut cmd = Command::new("gpg");
    cmd.args(["--batch", "--no-tty", "--quiet"]);
    if let Some(home) = homedir {
        cmd.arg("--homedir").arg(home.as_str());
    }
    cmd
}

/// Run gpg feeding `input` on stdin and returning raw stdout. Unlike
/// `run_get_string` this keeps the output binary.
fn run_gpg_io(mut cmd: Command, input: &[u8]) -> Result<Vec<u8>> {
    use std::io::{Read, Write};
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    let stderr = tempfile::tempfile()?;
    cmd.stderr(stderr.try_clone()?);
    tracing::debug!("exec: {cmd:?}");
    let mut child = cmd.spawn().context("Spawning gpg")?;
    child
        .stdin
        .take()
        .expect("piped stdin")
        .write_all(input)
        .context("Writing to gpg")?;
    let mut out = Vec::new();
    child
        .stdout
        .take()
        .expect("piped stdout")
        .read_to_end(&mut out)
        .context("Reading from gpg")?;
    use sandpak_utils::ExitStatusExt;
    child.wait()?.check_status(stderr)?;
    Ok(out)
}

/// Produce an OpenPGP signed message over `payload` using the named secret
/// keys from `homedir` (the caller's configured signing home).
#[context("Signing")]
pub fn sign(payload: &[u8], key_ids: &[String], homedir: Option<&Utf8Path>) -> Result<Vec<u8>> {
    if key_ids.is_empty() {
        return Err(Error::InvalidArgument("no signing keys given".into()).into());
    }
    let mut cmd = gpg_command(homedir);
    for key in key_ids {
        cmd.arg("--local-user").arg(key);
    }
    cmd.args(["--sign", "--output", "-"]);
    run_gpg_io(cmd, payload)
}

/// Outcome of a successful verification.
#[derive(Debug)]
pub struct VerifiedPayload {
    /// The parsed signature JSON.
    pub payload: SignatureJson,
    /// Fingerprint of the key that validated.
    pub key_fingerprint: String,
}

/// Verify an OpenPGP signed message against a trusted keyring.
///
/// The keyring bytes are imported into a fresh temporary GPG home; at least
/// one fully valid signature is required. The recovered payload must parse
/// as a signature JSON object of the expected type.
#[context("Verifying signature")]
pub fn verify(signed: &[u8], keyring: &[u8]) -> Result<VerifiedPayload> {
    let home = tempfile::Builder::new().prefix(".sandpak-gpg-").tempdir()?;
    std::fs::set_permissions(home.path(), std::fs::Permissions::from_mode(0o700))?;
    let home_path = Utf8Path::from_path(home.path())
        .ok_or_else(|| Error::InvalidArgument("non-UTF-8 tempdir".into()))?;

    let mut import = gpg_command(Some(home_path));
    import.arg("--import");
    run_gpg_io(import, keyring).context("Importing keyring")?;

    let signed_path = home_path.join("signed.gpg");
    std::fs::write(&signed_path, signed)?;
    let payload_path = home_path.join("payload");

    let mut cmd = gpg_command(Some(home_path));
    cmd.args([
        "--status-fd",
        "1",
        "--output",
        payload_path.as_str(),
        "--decrypt",
        signed_path.as_str(),
    ]);
    cmd.stdin(Stdio::null());
    tracing::debug!("exec: {cmd:?}");
    let output = cmd.output().context("Spawning gpg")?;
    let status = String::from_utf8_lossy(&output.stdout);
    let fingerprint = parse_status_validsig(&status);
    if !output.status.success() || fingerprint.is_none() {
        tracing::debug!(
            "gpg verification failed: {status}\n{}",
            String::from_utf8_lossy(&output.stderr)
        );
        return Err(Error::Untrusted("no valid signature found".into()).into());
    }
    let payload_bytes = std::fs::read(&payload_path).context("Reading verified payload")?;
    let payload: SignatureJson = serde_json::from_slice(&payload_bytes)
        .map_err(|e| Error::Untrusted(format!("signature payload: {e}")))?;
    if payload.critical.kind != SIGNATURE_TYPE {
        return Err(
            Error::Untrusted(format!("signature type {:?}", payload.critical.kind)).into(),
        );
    }
    Ok(VerifiedPayload {
        payload,
        key_fingerprint: fingerprint.expect("checked above"),
    })
}

/// Scan `--status-fd` output for a fully valid signature. `VALIDSIG` is
/// only emitted for signatures that check out against an imported key;
/// a `BADSIG` anywhere overrides.
fn parse_status_validsig(status: &str) -> Option<String> {
    let mut valid = None;
    for line in status.lines() {
        let mut fields = line.split_ascii_whitespace();
        if fields.next() != Some("[GNUPG:]") {
            continue;
        }
        match fields.next() {
            Some("VALIDSIG") => {
                valid = fields.next().map(|s| s.to_owned());
            }
            Some("BADSIG") => return None,
            _ => {}
        }
    }
    valid
}

/// Check a verified payload against what the caller expected it to vouch
/// for; a mismatch is untrusted, not merely invalid.
pub fn check_payload(
    payload: &SignatureJson,
    reference: &str,
    manifest_digest: &Digest,
) -> Result<()> {
    if payload.critical.image.manifest_digest != *manifest_digest {
        return Err(Error::Untrusted(format!(
            "signature is for {}, not {manifest_digest}",
            payload.critical.image.manifest_digest
        ))
        .into());
    }
    if payload.critical.identity.reference != reference {
        return Err(Error::Untrusted(format!(
            "signature is for {:?}, not {reference:?}",
            payload.critical.identity.reference
        ))
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::sha256_of_bytes;
    use crate::errors::error_kind;

    fn have_gpg() -> bool {
        Command::new("gpg").arg("--version").run().is_ok()
    }

    /// Generate a transient signing key, returning (homedir, keyring bytes).
    fn generate_key() -> Result<(tempfile::TempDir, Vec<u8>)> {
        let home = tempfile::Builder::new().prefix(".sandpak-test-gpg-").tempdir()?;
        std::fs::set_permissions(home.path(), std::fs::Permissions::from_mode(0o700))?;
        let home_path = Utf8Path::from_path(home.path()).unwrap();
        let mut cmd = gpg_command(Some(home_path));
        cmd.args([
            "--pinentry-mode",
            "loopback",
            "--passphrase",
            "",
            "--quick-generate-key",
            "tests@sandpak.example",
            "default",
            "sign",
        ]);
        cmd.run()?;
        let mut export = gpg_command(Some(home_path));
        export.args(["--export", "tests@sandpak.example"]);
        let keyring = run_gpg_io(export, &[])?;
        Ok((home, keyring))
    }

    #[test]
    fn payload_shape() {
        let digest = sha256_of_bytes(b"manifest").unwrap();
        let p = SignatureJson::new("origin:app/org.test.Hello/x86_64/master", &digest);
        let j = serde_json::to_value(&p).unwrap();
        assert_eq!(j["critical"]["type"], SIGNATURE_TYPE);
        assert_eq!(j["critical"]["image"]["docker-manifest-digest"], digest.as_str());
        assert_eq!(
            j["critical"]["identity"]["docker-reference"],
            "origin:app/org.test.Hello/x86_64/master"
        );
    }

    #[test]
    fn check_payload_mismatches() {
        let digest = sha256_of_bytes(b"manifest").unwrap();
        let other = sha256_of_bytes(b"other").unwrap();
        let p = SignatureJson::new("origin:app/org.test.Hello/x86_64/master", &digest);
        check_payload(&p, "origin:app/org.test.Hello/x86_64/master", &digest).unwrap();
        let e = check_payload(&p, "origin:app/org.test.Hello/x86_64/master", &other).unwrap_err();
        assert!(matches!(error_kind(&e), Some(Error::Untrusted(_))));
        let e = check_payload(&p, "elsewhere:app/org.test.Hello/x86_64/master", &digest)
            .unwrap_err();
        assert!(matches!(error_kind(&e), Some(Error::Untrusted(_))));
    }

    #[test]
    fn status_parsing() {
        let ok = "[GNUPG:] GOODSIG ABCD tests\n[GNUPG:] VALIDSIG 0123456789ABCDEF 2024-01-01\n";
        assert_eq!(parse_status_validsig(ok).as_deref(), Some("0123456789ABCDEF"));
        let bad = "[GNUPG:] BADSIG ABCD tests\n";
        assert_eq!(parse_status_validsig(bad), None);
        assert_eq!(parse_status_validsig(""), None);
        // BADSIG overrides a VALIDSIG from another signature
        let mixed = format!("{ok}[GNUPG:] BADSIG 00 x\n");
        assert_eq!(parse_status_validsig(&mixed), None);
    }

    #[test]
    fn sign_verify_roundtrip() -> Result<()> {
        if !have_gpg() {
            eprintln!("skipping: no gpg in PATH");
            return Ok(());
        }
        let (home, keyring) = generate_key()?;
        let home_path = Utf8Path::from_path(home.path()).unwrap();
        let digest = sha256_of_bytes(b"manifest body")?;
        let payload = SignatureJson::new("origin:app/org.test.Hello/x86_64/master", &digest);
        let payload_bytes = serde_json::to_vec(&payload)?;
        let signed = sign(
            &payload_bytes,
            &["tests@sandpak.example".to_string()],
            Some(home_path),
        )?;

        let verified = verify(&signed, &keyring)?;
        assert_eq!(verified.payload.critical.image.manifest_digest, digest);
        check_payload(
            &verified.payload,
            "origin:app/org.test.Hello/x86_64/master",
            &digest,
        )?;

        // An unrelated keyring must not verify
        let (_home2, other_keyring) = generate_key()?;
        let e = verify(&signed, &other_keyring).unwrap_err();
        assert!(matches!(error_kind(&e), Some(Error::Untrusted(_))));

        // Tampered message must not verify
        let mut tampered = signed.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0xff;
        assert!(verify(&tampered, &keyring).is_err());
        Ok(())
    }
}

//! Helpers intended for [`std::process::Command`] and related structures.

use std::io::{Read, Seek};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};

/// Helpers intended for [`std::process::ExitStatus`].
pub trait ExitStatusExt {
    /// If the exit status signals it was not successful, return an error.
    /// Note that we intentionally *don't* include the command string
    /// in the output; we leave it to the caller to add that if they want,
    /// as it may be verbose.
    fn check_status(&mut self, stderr: std::fs::File) -> Result<()>;
}

/// Parse the last chunk (e.g. 1024 bytes) from the provided file,
/// ensure it's UTF-8, and return that value. This function is infallible;
/// if the file cannot be read for some reason, a copy of a static string
/// is returned.
fn last_utf8_content_from_file(mut f: std::fs::File) -> String {
    // u16 since we truncate to just the trailing bytes here
    // to avoid pathological error messages
    const MAX_STDERR_BYTES: u16 = 1024;
    let size = f
        .metadata()
        .map_err(|e| {
            tracing::warn!("failed to fstat: {e}");
        })
        .map(|m| m.len().try_into().unwrap_or(u16::MAX))
        .unwrap_or(0);
    let size = size.min(MAX_STDERR_BYTES);
    let seek_offset = -(size as i32);
    let mut stderr_buf = Vec::with_capacity(size.into());
    // We should never fail to seek()+read() really, but let's be conservative
    let r = match f
        .seek(std::io::SeekFrom::End(seek_offset.into()))
        .and_then(|_| f.read_to_end(&mut stderr_buf))
    {
        Ok(_) => String::from_utf8_lossy(&stderr_buf),
        Err(e) => {
            tracing::warn!("failed seek+read: {e}");
            "<failed to read stderr>".into()
        }
    };
    (&*r).to_owned()
}

impl ExitStatusExt for std::process::ExitStatus {
    fn check_status(&mut self, stderr: std::fs::File) -> Result<()> {
        let stderr_buf = last_utf8_content_from_file(stderr);
        if self.success() {
            return Ok(());
        }
        anyhow::bail!(format!("Subprocess failed: {self:?}\n{stderr_buf}"))
    }
}

/// Helpers intended for [`std::process::Command`].
pub trait CommandRunExt {
    /// Log (at debug level) the full child commandline.
    fn log_debug(&mut self) -> &mut Self;

    /// Execute the child process, capturing stderr and returning a
    /// descriptive error including its trailing content on failure.
    fn run(&mut self) -> Result<()>;

    /// Execute the child process, returning its stdout as a `String`
    /// (stderr captured as for [`Self::run`]).
    fn run_get_string(&mut self) -> Result<String>;

    /// Execute the child process with stdin fed from the provided bytes.
    fn run_with_stdin_buf(&mut self, stdin: Option<&[u8]>) -> Result<()>;
}

/// Take a (borrowed) process exit status, and if the exit was unsuccessful,
/// synthesize an error message from the captured stderr tempfile.
fn run_with_stderr_capture(cmd: &mut Command, stdin: Option<&[u8]>) -> Result<()> {
    let stderr = tempfile::tempfile()?;
    cmd.stderr(stderr.try_clone()?);
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    let mut child = cmd.spawn().context("Spawning child process")?;
    if let Some(buf) = stdin {
        use std::io::Write;
        // Dropping the handle closes the pipe, unblocking the child.
        let mut child_stdin = child.stdin.take().expect("piped stdin");
        child_stdin.write_all(buf).context("Writing to stdin")?;
    }
    child.wait()?.check_status(stderr)
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        // This is useful for debugging, although sadly we can't guarantee
        // the command is valid UTF-8 so this is lossy.
        tracing::debug!("exec: {self:?}");
        self
    }

    fn run(&mut self) -> Result<()> {
        run_with_stderr_capture(self, None)
    }

    fn run_with_stdin_buf(&mut self, stdin: Option<&[u8]>) -> Result<()> {
        run_with_stderr_capture(self, stdin)
    }

    fn run_get_string(&mut self) -> Result<String> {
        let stderr = tempfile::tempfile()?;
        self.stderr(stderr.try_clone()?);
        self.stdin(Stdio::null());
        self.stdout(Stdio::piped());
        let child = self.spawn().context("Spawning child process")?;
        let o = child.wait_with_output()?;
        let mut status = o.status;
        status.check_status(stderr)?;
        String::from_utf8(o.stdout).context("Decoding stdout")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_run_ext() {
        // The basics
        Command::new("true").run().unwrap();
        assert!(Command::new("false").run().is_err());

        // Verify we capture stderr
        let e = Command::new("/bin/sh")
            .args(["-c", "echo expected-this-oops-message 1>&2; exit 1"])
            .run()
            .err()
            .unwrap();
        similar_asserts::assert_eq!(
            e.to_string(),
            "Subprocess failed: ExitStatus(unix_wait_status(256))\nexpected-this-oops-message\n"
        );

        // Ignoring stderr by default
        Command::new("/bin/sh")
            .args(["-c", "echo this-message-should-be-ignored 1>&2; exit 0"])
            .run()
            .unwrap();
    }

    #[test]
    fn command_run_get_string() {
        let s = Command::new("echo")
            .args(["-n", "hello"])
            .run_get_string()
            .unwrap();
        assert_eq!(s, "hello");
    }

    #[test]
    fn command_run_with_stdin() {
        Command::new("grep")
            .arg("-q")
            .arg("needle")
            .run_with_stdin_buf(Some(b"hay\nneedle\nhay\n"))
            .unwrap();
    }
}

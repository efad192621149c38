//! Inline signature verification in an isolated GnuPG environment.
//!
//! Keys are imported into a throwaway GnuPG home under the configured temp
//! prefix, so neither the user's keyring nor their trust database is
//! consulted or modified. The home is removed on every exit path.

use std::path::{Path, PathBuf};
use std::process::Command;

/// Signature verification failures.
#[derive(Debug)]
pub enum Error {
    /// A provided keyring could not be imported.
    KeyImportFailed(String),
    /// The file's inline signature did not verify.
    VerificationFailed(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::KeyImportFailed(detail) => {
                write!(f, "Cannot import provided GPG keyring: {}", detail)
            }
            Error::VerificationFailed(detail) => {
                write!(f, "Failed to verify buildinfo GPG signature: {}", detail)
            }
        }
    }
}

impl std::error::Error for Error {}

/// Extract the signer fingerprint from gpg `--status-fd` output.
fn validsig_fingerprint(status: &str) -> Option<String> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("[GNUPG:] VALIDSIG "))
        .and_then(|rest| rest.split_whitespace().next())
        .map(str::to_string)
}

/// Verify the inline signature of `file` against `keyrings`, in an isolated
/// GnuPG home created under `tmpdir`. Returns the signer fingerprint.
pub fn verify_file(keyrings: &[PathBuf], file: &Path, tmpdir: &Path) -> Result<String, Error> {
    let home = tempfile::Builder::new()
        .prefix("debrebuild-gnupg-")
        .tempdir_in(tmpdir)
        .map_err(|error| Error::KeyImportFailed(error.to_string()))?;

    for keyring in keyrings {
        let status = Command::new("gpg")
            .arg("--homedir")
            .arg(home.path())
            .args(["--batch", "--quiet", "--import"])
            .arg(keyring)
            .status()
            .map_err(|error| Error::KeyImportFailed(error.to_string()))?;
        if !status.success() {
            return Err(Error::KeyImportFailed(keyring.display().to_string()));
        }
    }

    let output = Command::new("gpg")
        .arg("--homedir")
        .arg(home.path())
        .args(["--batch", "--status-fd", "1", "--verify"])
        .arg(file)
        .output()
        .map_err(|error| Error::VerificationFailed(error.to_string()))?;
    if !output.status.success() {
        return Err(Error::VerificationFailed(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    validsig_fingerprint(&String::from_utf8_lossy(&output.stdout))
        .ok_or_else(|| Error::VerificationFailed("no valid signature found".to_string()))
}

//! in-toto attestation of rebuilt artifacts.
//!
//! After a successful verification the rebuild is recorded as an in-toto
//! `rebuild` step, signed with the operator's GPG key, so the result can be
//! fed to a rebuilder attestation collector.

use std::path::Path;
use std::process::Command;

/// Attestation failures.
#[derive(Debug)]
pub enum Error {
    /// `in-toto-run` could not be spawned.
    Spawn(std::io::Error),
    /// `in-toto-run` exited with a failure status.
    Failed(i32),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Spawn(error) => write!(f, "in-toto metadata generation failed: {}", error),
            Error::Failed(code) => {
                write!(f, "in-toto metadata generation failed with exit code {}", code)
            }
        }
    }
}

impl std::error::Error for Error {}

fn intoto_args(products: &[String], gpg_sign_keyid: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "--step-name=rebuild".to_string(),
        "--no-command".to_string(),
        "--products".to_string(),
    ];
    args.extend(products.iter().cloned());
    args.push("--gpg".to_string());
    if let Some(keyid) = gpg_sign_keyid {
        args.push(keyid.to_string());
    }
    args
}

/// Record the rebuilt `products` as a signed in-toto link file in
/// `output_dir`.
pub fn generate_metadata(
    output_dir: &Path,
    products: &[String],
    gpg_sign_keyid: Option<&str>,
) -> Result<(), Error> {
    let status = Command::new("in-toto-run")
        .args(intoto_args(products, gpg_sign_keyid))
        .current_dir(output_dir)
        .status()
        .map_err(Error::Spawn)?;
    if !status.success() {
        return Err(Error::Failed(status.code().unwrap_or(1)));
    }
    log::info!("in-toto metadata generation: OK");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intoto_args_with_keyid() {
        let args = intoto_args(
            &["hello_2.10-2_amd64.deb".to_string()],
            Some("0123456789ABCDEF"),
        );
        assert_eq!(
            args,
            vec![
                "--step-name=rebuild",
                "--no-command",
                "--products",
                "hello_2.10-2_amd64.deb",
                "--gpg",
                "0123456789ABCDEF",
            ]
        );
    }

    #[test]
    fn test_intoto_args_default_key() {
        let args = intoto_args(&["a.deb".to_string()], None);
        assert_eq!(args.last().unwrap(), "--gpg");
    }
}

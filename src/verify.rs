//! Comparison of recorded and rebuilt artifact checksums.

use crate::buildinfo::BuildInfo;

/// Ways the rebuilt artifacts can differ from the recorded ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The rebuild produced a different number of files.
    FileCountDiffers {
        /// Files the original buildinfo recorded.
        original: Vec<String>,
        /// Files the rebuild produced.
        rebuilt: Vec<String>,
    },
    /// A file's size differs.
    SizeDiffers(String),
    /// A digest present in the original is missing from the rebuild.
    MissingChecksumAlg(String, String),
    /// A digest differs.
    ChecksumDiffers(String, String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::FileCountDiffers { .. } => {
                write!(f, "New buildinfo contains a different number of files")
            }
            Error::SizeDiffers(file) => write!(f, "Size differs for {}", file),
            Error::MissingChecksumAlg(file, alg) => {
                write!(f, "{} of {} is not present in both buildinfo files", alg, file)
            }
            Error::ChecksumDiffers(file, alg) => {
                write!(f, "Value of {} differs for {}", alg, file)
            }
        }
    }
}

impl std::error::Error for Error {}

/// Check that every artifact the original build recorded was reproduced
/// bit-identically.
///
/// `.dsc` files in the original are skipped: the source description is not
/// regenerated identically. Pure and deterministic.
pub fn verify_checksums(original: &BuildInfo, rebuilt: &BuildInfo) -> Result<(), Error> {
    let files: Vec<&String> = original
        .checksums
        .keys()
        .filter(|file| !file.ends_with(".dsc"))
        .collect();
    if files.len() != rebuilt.checksums.len() {
        log::debug!(
            "old buildinfo: {}",
            files.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(" ")
        );
        log::debug!(
            "new buildinfo: {}",
            rebuilt.checksums.keys().cloned().collect::<Vec<_>>().join(" ")
        );
        return Err(Error::FileCountDiffers {
            original: files.into_iter().cloned().collect(),
            rebuilt: rebuilt.checksums.keys().cloned().collect(),
        });
    }

    for file in files {
        let recorded = &original.checksums[file];
        let produced = match rebuilt.checksums.get(file) {
            Some(produced) => produced,
            None => return Err(Error::MissingChecksumAlg(file.clone(), "size".to_string())),
        };
        if recorded.size != produced.size {
            return Err(Error::SizeDiffers(file.clone()));
        }
        for (alg, digest) in &recorded.digests {
            match produced.digests.get(alg) {
                None => {
                    return Err(Error::MissingChecksumAlg(file.clone(), alg.clone()));
                }
                Some(reproduced) if reproduced != digest => {
                    return Err(Error::ChecksumDiffers(file.clone(), alg.clone()));
                }
                Some(_) => {}
            }
        }
        log::info!("{}: OK", file);
    }
    log::info!("Checksums: OK");
    Ok(())
}

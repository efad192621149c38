//! Ephemeral apt root and snapshot package index cache.
//!
//! The resolver needs to know whether apt, pointed at a given set of snapshot
//! sources, would actually see a package at its exact pinned version. Instead
//! of depending on the host's apt library this module downloads the
//! `binary-<arch>/Packages` indexes the sources publish and answers
//! membership queries from them. The apt root it maintains on disk (apt.conf,
//! sources.list, trusted keyrings) is the same layout apt itself would use,
//! and is handed to the external builder.

use crate::sources::SourcesEntry;
use debversion::Version;
use flate2::read::GzDecoder;
use std::collections::HashSet;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Keyrings trusted by default inside the ephemeral apt root.
const DEFAULT_KEYRINGS: &[&str] = &[
    "/usr/share/keyrings/debian-archive-keyring.gpg",
    "/usr/share/keyrings/debian-archive-removed-keys.gpg",
];

/// Errors raised by the apt root or the package index cache.
#[derive(Debug)]
pub enum Error {
    /// The apt root could not be initialized or updated.
    Init(std::io::Error),
    /// A package index could not be downloaded.
    Fetch {
        /// The index URL.
        url: String,
        /// The underlying HTTP error.
        error: reqwest::Error,
    },
    /// A package index could not be read or decompressed.
    Index {
        /// The index URL.
        url: String,
        /// The underlying read error.
        error: std::io::Error,
    },
    /// No package index was found under any known compression suffix.
    IndexNotFound(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Init(error) => write!(f, "Failed to initialize APT cache: {}", error),
            Error::Fetch { url, error } => write!(f, "Failed to fetch {}: {}", url, error),
            Error::Index { url, error } => write!(f, "Failed to read index {}: {}", url, error),
            Error::IndexNotFound(url) => write!(f, "No package index found at {}", url),
        }
    }
}

impl std::error::Error for Error {}

/// An apt configuration rooted in a throwaway temp directory.
///
/// The directory is removed when the value is dropped, on every exit path.
/// It is created inside the configured temp prefix, so cleanup can never
/// touch an unrelated directory.
pub struct AptRoot {
    dir: TempDir,
    lines: Vec<String>,
}

impl AptRoot {
    /// Create the root under `tmpdir` with the standard layout:
    /// `etc/apt/apt.conf`, `etc/apt/sources.list` seeded with `sources`, and
    /// the Debian archive keyrings (plus `extra_keys`) symlinked into
    /// `etc/apt/trusted.gpg.d/`.
    pub fn create(
        tmpdir: &Path,
        build_arch: &str,
        proxy: Option<&str>,
        sources: &[String],
        extra_keys: &[PathBuf],
    ) -> Result<Self, Error> {
        let dir = tempfile::Builder::new()
            .prefix("debrebuild-")
            .tempdir_in(tmpdir)
            .map_err(Error::Init)?;
        let apt_dir = dir.path().join("etc/apt");
        std::fs::create_dir_all(apt_dir.join("trusted.gpg.d")).map_err(Error::Init)?;

        let mut apt_conf = format!(
            r#"
Apt {{
   Architecture "{build_arch}";
   Architectures "{build_arch}";
}};

Acquire::Check-Valid-Until "false";
Acquire::Languages "none";
Acquire::http::Dl-Limit "1000";
Acquire::https::Dl-Limit "1000";
Acquire::Retries "5";
Binary::apt-get::Acquire::AllowInsecureRepositories "false";
"#
        );
        if let Some(proxy) = proxy {
            apt_conf.push_str(&format!("\nAcquire::http::proxy \"{}\";\n", proxy));
        }
        std::fs::write(apt_dir.join("apt.conf"), apt_conf).map_err(Error::Init)?;
        std::fs::write(apt_dir.join("sources.list"), sources.join("\n")).map_err(Error::Init)?;

        for keyring in DEFAULT_KEYRINGS
            .iter()
            .map(PathBuf::from)
            .chain(extra_keys.iter().cloned())
        {
            let name = match keyring.file_name() {
                Some(name) => name.to_owned(),
                None => continue,
            };
            std::os::unix::fs::symlink(&keyring, apt_dir.join("trusted.gpg.d").join(name))
                .map_err(Error::Init)?;
        }

        Ok(Self {
            dir,
            lines: sources.to_vec(),
        })
    }

    /// The root directory.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Path of the sources.list inside the root.
    pub fn sources_list_path(&self) -> PathBuf {
        self.dir.path().join("etc/apt/sources.list")
    }

    /// Append a sources.list line, unless it is already present.
    pub fn append_source(&mut self, line: &str) -> std::io::Result<()> {
        if self.lines.iter().any(|existing| existing == line) {
            return Ok(());
        }
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(self.sources_list_path())?;
        writeln!(file)?;
        write!(file, "{}", line)?;
        self.lines.push(line.to_string());
        Ok(())
    }
}

/// Parse a `Packages` index, collecting `(name, version, architecture)`
/// records.
pub fn parse_packages_index<R: Read>(
    reader: R,
    records: &mut HashSet<(String, String, String)>,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    let mut name = None;
    let mut version = None;
    let mut architecture = None;
    loop {
        line.clear();
        let read = reader.read_line(&mut line)?;
        let trimmed = line.trim_end();
        if read == 0 || trimmed.is_empty() {
            if let (Some(name), Some(version), Some(architecture)) =
                (name.take(), version.take(), architecture.take())
            {
                records.insert((name, version, architecture));
            }
            if read == 0 {
                return Ok(());
            }
            continue;
        }
        if let Some(value) = trimmed.strip_prefix("Package: ") {
            name = Some(value.trim().to_string());
        } else if let Some(value) = trimmed.strip_prefix("Version: ") {
            version = Some(value.trim().to_string());
        } else if let Some(value) = trimmed.strip_prefix("Architecture: ") {
            architecture = Some(value.trim().to_string());
        }
    }
}

/// Wrap a raw index reader in the right decompressor for its suffix.
fn decompress<'a, R: Read + 'a>(reader: R, ext: &str) -> std::io::Result<Box<dyn Read + 'a>> {
    match ext {
        ".gz" => Ok(Box::new(GzDecoder::new(reader))),
        ".xz" => {
            let mut input = BufReader::new(reader);
            let mut data = Vec::new();
            lzma_rs::xz_decompress(&mut input, &mut data).map_err(|error| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, format!("{:?}", error))
            })?;
            Ok(Box::new(std::io::Cursor::new(data)))
        }
        _ => Ok(Box::new(reader)),
    }
}

/// Package membership answered from downloaded snapshot `Packages` indexes.
///
/// Owns the ephemeral [`AptRoot`]; every source line handed to
/// [`SnapshotPackageCache::refresh`] is appended to the root's sources.list
/// and its indexes are downloaded once.
pub struct SnapshotPackageCache {
    root: AptRoot,
    client: reqwest::blocking::Client,
    arches: Vec<String>,
    ingested: HashSet<String>,
    records: HashSet<(String, String, String)>,
}

impl SnapshotPackageCache {
    /// Create a cache over `root`, downloading indexes for `arches`.
    pub fn new(root: AptRoot, arches: Vec<String>, client: reqwest::blocking::Client) -> Self {
        Self {
            root,
            client,
            arches,
            ingested: HashSet::new(),
            records: HashSet::new(),
        }
    }

    /// Make the cache reflect `sources`, fetching indexes of lines not seen
    /// before.
    pub fn refresh(&mut self, sources: &[String]) -> Result<(), Error> {
        for line in sources {
            if self.ingested.contains(line) {
                continue;
            }
            self.root.append_source(line).map_err(Error::Init)?;
            if let Some(entry) = SourcesEntry::parse(line) {
                for arch in self.arches.clone() {
                    for url in entry.packages_urls(&arch) {
                        self.ingest_index(&url)?;
                    }
                }
            }
            self.ingested.insert(line.clone());
        }
        Ok(())
    }

    /// Whether an exact `(name, version, architecture)` record was seen.
    pub fn contains(&self, name: &str, version: &Version, architecture: &str) -> bool {
        self.records.contains(&(
            name.to_string(),
            version.to_string(),
            architecture.to_string(),
        ))
    }

    fn ingest_index(&mut self, url: &str) -> Result<(), Error> {
        for ext in [".gz", ".xz", ""] {
            let full = format!("{}{}", url, ext);
            let resp = self
                .client
                .get(&full)
                .send()
                .map_err(|error| Error::Fetch {
                    url: full.clone(),
                    error,
                })?;
            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                continue;
            }
            let resp = resp.error_for_status().map_err(|error| Error::Fetch {
                url: full.clone(),
                error,
            })?;
            log::debug!("Reading package index {}", full);
            let reader = decompress(resp, ext).map_err(|error| Error::Index {
                url: full.clone(),
                error,
            })?;
            return parse_packages_index(reader, &mut self.records).map_err(|error| {
                Error::Index {
                    url: full.clone(),
                    error,
                }
            });
        }
        Err(Error::IndexNotFound(url.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PACKAGES: &str = "Package: hello\n\
        Version: 2.10-2\n\
        Architecture: amd64\n\
        Description: example\n\
        \n\
        Package: base-files\n\
        Version: 11.1\n\
        Architecture: amd64\n\
        \n\
        Package: tzdata\n\
        Version: 2021a-1\n\
        Architecture: all\n";

    #[test]
    fn test_parse_packages_index() {
        let mut records = HashSet::new();
        parse_packages_index(std::io::Cursor::new(PACKAGES), &mut records).unwrap();
        assert_eq!(records.len(), 3);
        assert!(records.contains(&(
            "hello".to_string(),
            "2.10-2".to_string(),
            "amd64".to_string()
        )));
        assert!(records.contains(&(
            "tzdata".to_string(),
            "2021a-1".to_string(),
            "all".to_string()
        )));
    }

    #[test]
    fn test_decompress_gz_roundtrip() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(PACKAGES.as_bytes()).unwrap();
        let compressed = encoder.finish().unwrap();
        let mut records = HashSet::new();
        let reader = decompress(std::io::Cursor::new(compressed), ".gz").unwrap();
        parse_packages_index(reader, &mut records).unwrap();
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn test_apt_root_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let sources = vec![
            "deb http://snapshot.debian.org/archive/debian/20210504T120000Z/ bullseye main"
                .to_string(),
        ];
        let root = AptRoot::create(tmp.path(), "amd64", Some("http://proxy:3128"), &sources, &[])
            .unwrap();
        let apt_conf = std::fs::read_to_string(root.path().join("etc/apt/apt.conf")).unwrap();
        assert!(apt_conf.contains("Architecture \"amd64\";"));
        assert!(apt_conf.contains("Acquire::Check-Valid-Until \"false\";"));
        assert!(apt_conf.contains("Acquire::http::proxy \"http://proxy:3128\";"));
        let listed = std::fs::read_to_string(root.sources_list_path()).unwrap();
        assert_eq!(listed, sources[0]);
        assert!(root.path().join("etc/apt/trusted.gpg.d").is_dir());
    }

    #[test]
    fn test_apt_root_append_source_dedup() {
        let tmp = tempfile::tempdir().unwrap();
        let base = "deb http://example.org/ bullseye main".to_string();
        let mut root = AptRoot::create(tmp.path(), "amd64", None, &[base.clone()], &[]).unwrap();
        let line = "deb http://snapshot.debian.org/archive/debian/20210504T120000Z unstable main";
        root.append_source(line).unwrap();
        root.append_source(line).unwrap();
        root.append_source(&base).unwrap();
        let listed = std::fs::read_to_string(root.sources_list_path()).unwrap();
        assert_eq!(listed, format!("{}\n{}", base, line));
    }

    #[test]
    fn test_apt_root_removed_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let path = {
            let root = AptRoot::create(tmp.path(), "amd64", None, &[], &[]).unwrap();
            root.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}

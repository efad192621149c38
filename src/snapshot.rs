//! Client for the snapshot archive metadata API.
//!
//! The snapshot archive (snapshot.debian.org) is a time-indexed mirror of the
//! Debian package pool. Its metadata API answers, for a `(name, version)`
//! pair, which files belong to the package and when each file was first seen
//! in the archive. That first-seen timestamp is the canonical index under
//! which the file can be fetched again.

use crate::buildinfo::Package;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Default metadata query endpoint.
pub const DEFAULT_QUERY_URL: &str = "http://snapshot.debian.org";

/// Default timestamped package mirror.
pub const DEFAULT_BASE_MIRROR: &str = "http://snapshot.debian.org/archive/debian";

/// Errors raised while querying the snapshot archive.
#[derive(Debug)]
pub enum Error {
    /// Connection or HTTP-level failure.
    Transport(reqwest::Error),
    /// A response that should have been JSON was not parseable.
    BadJson {
        /// The queried URL.
        url: String,
        /// The underlying decode error.
        error: serde_json::Error,
    },
    /// No source package file in the Debian archive matches.
    NoSourceFound(String),
    /// More than one source package file with the same hash in the Debian
    /// archive.
    AmbiguousSource(String),
    /// No binary package file in the Debian archive matches.
    NoBinaryFound(String),
    /// More than one binary package file with the same hash in the Debian
    /// archive.
    AmbiguousBinary(String),
    /// No file of the package exists for the wanted architecture.
    NoArchMatch {
        /// Binary package name.
        package: String,
        /// The architecture that was looked for.
        architecture: String,
    },
    /// The architecture recorded in the input does not match the only
    /// architecture the archive knows the package for.
    ArchMismatchExplicit {
        /// Binary package name.
        package: String,
        /// The architecture the input recorded.
        requested: String,
        /// The architecture the archive has.
        found: String,
    },
    /// No architecture was recorded and the archive's only candidate is
    /// neither the build architecture nor `all`.
    ArchMismatchImplicit {
        /// Binary package name.
        package: String,
        /// The build architecture that was implied.
        build_arch: String,
        /// The architecture the archive has.
        found: String,
    },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Transport(error) => write!(f, "Cannot query snapshot archive: {}", error),
            Error::BadJson { url, error } => {
                write!(f, "Cannot parse response for {}: {}", url, error)
            }
            Error::NoSourceFound(name) => {
                write!(f, "No source package {} with the right hash in Debian official", name)
            }
            Error::AmbiguousSource(name) => write!(
                f,
                "More than one source package {} with the same hash in Debian official",
                name
            ),
            Error::NoBinaryFound(name) => {
                write!(f, "No package {} with the right hash in Debian official", name)
            }
            Error::AmbiguousBinary(name) => write!(
                f,
                "More than one package {} with the same hash in Debian official",
                name
            ),
            Error::NoArchMatch {
                package,
                architecture,
            } => write!(
                f,
                "Cannot find package {} in architecture {}",
                package, architecture
            ),
            Error::ArchMismatchExplicit {
                package,
                requested,
                found,
            } => write!(
                f,
                "Package {} was explicitly requested {} but only {} was found",
                package, requested, found
            ),
            Error::ArchMismatchImplicit {
                package,
                build_arch,
                found,
            } => write!(
                f,
                "Package {} was implicitly requested {} but only {} was found",
                package, build_arch, found
            ),
        }
    }
}

impl std::error::Error for Error {}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        Error::Transport(error)
    }
}

#[derive(Debug, Deserialize)]
struct SrcFilesResponse {
    #[serde(default)]
    result: Vec<SrcFileResult>,
    #[serde(default)]
    fileinfo: HashMap<String, Vec<FileInfo>>,
}

#[derive(Debug, Deserialize)]
struct SrcFileResult {
    hash: String,
}

#[derive(Debug, Deserialize)]
struct BinFilesResponse {
    #[serde(default)]
    result: Vec<BinFileResult>,
    #[serde(default)]
    fileinfo: HashMap<String, Vec<FileInfo>>,
}

#[derive(Debug, Deserialize)]
struct BinFileResult {
    hash: String,
    architecture: String,
}

#[derive(Debug, Deserialize)]
struct FileInfo {
    archive_name: String,
    #[serde(default)]
    name: String,
    first_seen: String,
}

/// The archive's record of a source package upload.
#[derive(Debug, Clone)]
pub struct SourceRecord {
    /// When the `.dsc` was first seen in the archive.
    pub first_seen: String,
    /// Hash of the `.dsc` file.
    pub hash: String,
}

/// Read-only client over the snapshot metadata service.
pub struct SnapshotClient {
    query_url: String,
    client: reqwest::blocking::Client,
}

impl SnapshotClient {
    /// Create a client against `query_url`, optionally tunneling through an
    /// HTTP proxy. Redirects are followed; requests time out after two
    /// minutes (the metadata service can be slow).
    pub fn new(query_url: &str, proxy: Option<&str>) -> Result<Self, Error> {
        let mut builder = reqwest::blocking::Client::builder().timeout(Duration::from_secs(120));
        if let Some(proxy) = proxy {
            builder = builder
                .proxy(reqwest::Proxy::http(proxy)?)
                .proxy(reqwest::Proxy::https(proxy)?);
        }
        Ok(Self {
            query_url: query_url.trim_end_matches('/').to_string(),
            client: builder.build()?,
        })
    }

    /// The underlying HTTP client, shared with the package index cache so
    /// proxy and timeout configuration stay in one place.
    pub fn http(&self) -> &reqwest::blocking::Client {
        &self.client
    }

    /// Fetch a remote file as text, e.g. a `.buildinfo` served over HTTP(S).
    pub fn fetch_text(&self, url: &str) -> Result<String, Error> {
        Ok(self
            .client
            .get(url)
            .send()?
            .error_for_status()?
            .text()?)
    }

    /// Probe `url` with a HEAD request.
    pub fn head_ok(&self, url: &str) -> bool {
        self.client
            .head(url)
            .send()
            .map(|resp| resp.status().is_success())
            .unwrap_or(false)
    }

    /// GET a JSON document. `Ok(None)` means the service answered 404.
    fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<Option<T>, Error> {
        let resp = self.client.get(url).send()?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let text = resp.error_for_status()?.text()?;
        match serde_json::from_str(&text) {
            Ok(data) => Ok(Some(data)),
            Err(error) => Err(Error::BadJson {
                url: url.to_string(),
                error,
            }),
        }
    }

    /// Look up the `.dsc` record of a source package in the Debian archive.
    pub fn source_record(&self, name: &str, version: &str) -> Result<SourceRecord, Error> {
        log::debug!("Get source package info: {}={}", name, version);
        let url = format!(
            "{}/mr/package/{}/{}/srcfiles?fileinfo=1",
            self.query_url, name, version
        );
        let data: SrcFilesResponse = self
            .get_json(&url)?
            .ok_or_else(|| Error::NoSourceFound(name.to_string()))?;
        select_source(&data, name)
    }

    /// Resolve a pinned binary package against the archive, filling in its
    /// `architecture`, `first_seen` and `hash`.
    pub fn resolve_binary(&self, pkg: &mut Package, build_arch: &str) -> Result<(), Error> {
        log::debug!("Get binary package info: {}={}", pkg.name, pkg.version);
        let url = format!(
            "{}/mr/binary/{}/{}/binfiles?fileinfo=1",
            self.query_url, pkg.name, pkg.version
        );
        let data: BinFilesResponse = self
            .get_json(&url)?
            .ok_or_else(|| Error::NoBinaryFound(pkg.name.clone()))?;
        let (hash, architecture) = select_binary(&data, pkg, build_arch)?;
        let from_main: Vec<&FileInfo> = data
            .fileinfo
            .get(&hash)
            .into_iter()
            .flatten()
            .filter(|info| info.archive_name == "debian")
            .collect();
        if from_main.len() > 1 {
            return Err(Error::AmbiguousBinary(pkg.name.clone()));
        }
        let info = from_main
            .first()
            .ok_or_else(|| Error::NoBinaryFound(pkg.name.clone()))?;
        pkg.first_seen = Some(info.first_seen.clone());
        pkg.hash = Some(hash);
        pkg.architecture = Some(architecture);
        Ok(())
    }
}

/// Pick the unique `.dsc` file record hosted by the Debian archive.
fn select_source(data: &SrcFilesResponse, name: &str) -> Result<SourceRecord, Error> {
    let mut from_main = vec![];
    for result in &data.result {
        for info in data.fileinfo.get(&result.hash).into_iter().flatten() {
            if info.archive_name == "debian" && info.name.ends_with(".dsc") {
                from_main.push(SourceRecord {
                    first_seen: info.first_seen.clone(),
                    hash: result.hash.clone(),
                });
            }
        }
    }
    if from_main.len() > 1 {
        return Err(Error::AmbiguousSource(name.to_string()));
    }
    from_main
        .pop()
        .ok_or_else(|| Error::NoSourceFound(name.to_string()))
}

/// Decide which file record of a binary package satisfies the pin.
///
/// With a single candidate its architecture is adopted and checked against
/// what the input recorded (or, absent a record, against the build
/// architecture and `all`). With several candidates the first one matching
/// the wanted architecture wins.
fn select_binary(
    data: &BinFilesResponse,
    pkg: &Package,
    build_arch: &str,
) -> Result<(String, String), Error> {
    if data.result.len() == 1 {
        let result = &data.result[0];
        match pkg.architecture.as_deref() {
            Some(requested) => {
                if requested != result.architecture {
                    return Err(Error::ArchMismatchExplicit {
                        package: pkg.name.clone(),
                        requested: requested.to_string(),
                        found: result.architecture.clone(),
                    });
                }
            }
            None => {
                if result.architecture != build_arch && result.architecture != "all" {
                    return Err(Error::ArchMismatchImplicit {
                        package: pkg.name.clone(),
                        build_arch: build_arch.to_string(),
                        found: result.architecture.clone(),
                    });
                }
            }
        }
        return Ok((result.hash.clone(), result.architecture.clone()));
    }
    let target = pkg.architecture.as_deref().unwrap_or(build_arch);
    data.result
        .iter()
        .find(|result| result.architecture == target)
        .map(|result| (result.hash.clone(), result.architecture.clone()))
        .ok_or_else(|| Error::NoArchMatch {
            package: pkg.name.clone(),
            architecture: target.to_string(),
        })
}

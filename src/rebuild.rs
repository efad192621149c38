//! Orchestration of the whole rebuild pipeline.
//!
//! Stage 1 pins the source package and every build dependency to snapshot
//! archive timestamps and selects the covering apt sources. Stage 2 hands
//! the synthesized plan to the external builder. Stage 3 parses the
//! `.buildinfo` the builder produced, compares checksums and records the
//! attestation. Every stage is fallible and terminal; the ephemeral apt root
//! and any spooled remote buildinfo are removed on all exit paths.

use crate::apt::{AptRoot, SnapshotPackageCache};
use crate::build::{BuildPlan, Builder};
use crate::buildinfo::BuildInfo;
use crate::snapshot::SnapshotClient;
use crate::{apt, attest, build, buildinfo, gpg, resolver, snapshot, verify};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Any failure the pipeline can end with.
#[derive(Debug)]
pub enum Error {
    /// The buildinfo file does not exist.
    BuildInfoNotFound(PathBuf),
    /// The buildinfo could not be parsed or interpreted.
    BuildInfo(buildinfo::Error),
    /// Signature verification failed.
    Gpg(gpg::Error),
    /// A snapshot archive lookup failed.
    Snapshot(snapshot::Error),
    /// Dependency resolution failed.
    Resolver(resolver::Error),
    /// The ephemeral apt root or package cache failed.
    Apt(apt::Error),
    /// Planning or running the build failed.
    Build(build::Error),
    /// The rebuilt artifacts do not match the record.
    Verify(verify::Error),
    /// Attestation generation failed.
    Attest(attest::Error),
    /// An extra repository file could not be read.
    RepositoryFile(PathBuf, std::io::Error),
    /// The predicted output buildinfo already exists.
    RefuseOverwrite(PathBuf),
    /// The builder host architecture could not be determined.
    HostArchitecture(std::io::Error),
    /// An ambient I/O failure.
    Io(std::io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::BuildInfoNotFound(path) => {
                write!(f, "Cannot find buildinfo file: {}", path.display())
            }
            Error::BuildInfo(error) => write!(f, "{}", error),
            Error::Gpg(error) => write!(f, "{}", error),
            Error::Snapshot(error) => write!(f, "{}", error),
            Error::Resolver(error) => write!(f, "{}", error),
            Error::Apt(error) => write!(f, "{}", error),
            Error::Build(error) => write!(f, "{}", error),
            Error::Verify(error) => write!(f, "{}", error),
            Error::Attest(error) => write!(f, "{}", error),
            Error::RepositoryFile(path, error) => {
                write!(f, "Cannot read repository file {}: {}", path.display(), error)
            }
            Error::RefuseOverwrite(path) => write!(
                f,
                "Refusing to overwrite existing buildinfo file: {}",
                path.display()
            ),
            Error::HostArchitecture(error) => {
                write!(f, "Cannot determine builder host architecture: {}", error)
            }
            Error::Io(error) => write!(f, "{}", error),
        }
    }
}

impl std::error::Error for Error {}

impl From<buildinfo::Error> for Error {
    fn from(error: buildinfo::Error) -> Self {
        Error::BuildInfo(error)
    }
}

impl From<gpg::Error> for Error {
    fn from(error: gpg::Error) -> Self {
        Error::Gpg(error)
    }
}

impl From<snapshot::Error> for Error {
    fn from(error: snapshot::Error) -> Self {
        Error::Snapshot(error)
    }
}

impl From<resolver::Error> for Error {
    fn from(error: resolver::Error) -> Self {
        Error::Resolver(error)
    }
}

impl From<apt::Error> for Error {
    fn from(error: apt::Error) -> Self {
        Error::Apt(error)
    }
}

impl From<build::Error> for Error {
    fn from(error: build::Error) -> Self {
        Error::Build(error)
    }
}

impl From<verify::Error> for Error {
    fn from(error: verify::Error) -> Self {
        Error::Verify(error)
    }
}

impl From<attest::Error> for Error {
    fn from(error: attest::Error) -> Self {
        Error::Attest(error)
    }
}

/// Configuration of a rebuild run.
pub struct RebuilderOptions {
    /// Path or URL of the input buildinfo.
    pub buildinfo: String,
    /// Metadata query endpoint.
    pub query_url: String,
    /// Timestamped package mirror.
    pub base_mirror: String,
    /// Extra sources.list snippets offered to the build.
    pub extra_repository_files: Vec<PathBuf>,
    /// Extra keys trusted during the build.
    pub extra_repository_keys: Vec<PathBuf>,
    /// Key id signing the in-toto attestation.
    pub gpg_sign_keyid: Option<String>,
    /// Verify the buildinfo's inline signature before using it.
    pub gpg_verify: bool,
    /// Keyrings the signature may verify against.
    pub gpg_verify_keys: Vec<PathBuf>,
    /// HTTP(S) proxy.
    pub proxy: Option<String>,
    /// Also offer the current deb.debian.org mirror as a source-package
    /// fallback. Off by default: the current mirror may have drifted from
    /// what the snapshot archive saw.
    pub current_mirror_fallback: bool,
}

impl Default for RebuilderOptions {
    fn default() -> Self {
        Self {
            buildinfo: String::new(),
            query_url: snapshot::DEFAULT_QUERY_URL.to_string(),
            base_mirror: snapshot::DEFAULT_BASE_MIRROR.to_string(),
            extra_repository_files: vec![],
            extra_repository_keys: vec![],
            gpg_sign_keyid: None,
            gpg_verify: false,
            gpg_verify_keys: vec![],
            proxy: None,
            current_mirror_fallback: false,
        }
    }
}

/// Drives one rebuild from a parsed buildinfo to verified artifacts.
pub struct Rebuilder {
    buildinfo: BuildInfo,
    snapshot: SnapshotClient,
    options: RebuilderOptions,
    tmpdir: PathBuf,
}

/// The architecture token dpkg-genbuildinfo puts in the output filename.
/// `None` means the builder host architecture is used.
fn fixed_artifact_arch(buildinfo: &BuildInfo) -> Result<Option<&'static str>, build::Error> {
    if !buildinfo.architecture.is_empty() {
        Ok(None)
    } else if buildinfo.build_archall {
        Ok(Some("all"))
    } else if buildinfo.build_source {
        Ok(Some("source"))
    } else {
        Err(build::Error::NothingToBuild)
    }
}

/// Ask dpkg for the architecture of the machine running the builder.
fn host_architecture() -> Result<String, Error> {
    let output = std::process::Command::new("dpkg")
        .arg("--print-architecture")
        .output()
        .map_err(Error::HostArchitecture)?;
    if !output.status.success() {
        return Err(Error::HostArchitecture(std::io::Error::new(
            std::io::ErrorKind::Other,
            "dpkg --print-architecture failed",
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Keep only the lines of a repository snippet that mean something to apt.
fn filter_repository_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .filter(|line| !line.starts_with('#') && !line.trim().is_empty())
        .map(str::to_string)
        .collect()
}

impl Rebuilder {
    /// Fetch (if remote), optionally verify, and parse the input buildinfo.
    pub fn new(options: RebuilderOptions) -> Result<Self, Error> {
        let tmpdir = std::env::var_os("TMPDIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/tmp"));
        let snapshot = SnapshotClient::new(&options.query_url, options.proxy.as_deref())?;

        // A remote buildinfo is spooled into the temp prefix so signature
        // verification sees exactly the bytes that get parsed. The spool
        // file is removed when this function returns.
        let mut spooled = None;
        let path = if options.buildinfo.starts_with("http://")
            || options.buildinfo.starts_with("https://")
        {
            let text = snapshot.fetch_text(&options.buildinfo)?;
            let mut file = tempfile::Builder::new()
                .prefix("buildinfo-")
                .tempfile_in(&tmpdir)
                .map_err(Error::Io)?;
            file.write_all(text.as_bytes()).map_err(Error::Io)?;
            let path = file.path().to_path_buf();
            spooled = Some(file);
            path
        } else {
            let path = PathBuf::from(&options.buildinfo);
            if !path.exists() {
                return Err(Error::BuildInfoNotFound(path));
            }
            path
        };

        if options.gpg_verify {
            if options.gpg_verify_keys.is_empty() {
                return Err(Error::Gpg(gpg::Error::KeyImportFailed(
                    "no GPG keyring provided".to_string(),
                )));
            }
            let fingerprint = gpg::verify_file(&options.gpg_verify_keys, &path, &tmpdir)?;
            log::info!("GPG ({}): OK", fingerprint);
        }

        let text = std::fs::read_to_string(&path).map_err(Error::Io)?;
        let buildinfo: BuildInfo = text.parse()?;
        drop(spooled);

        Ok(Self {
            buildinfo,
            snapshot,
            options,
            tmpdir,
        })
    }

    /// The base sources list: the snapshot of the release the build ran
    /// against (when the archive has one for the build date), plus any
    /// opt-in current-mirror fallback and caller-supplied extra
    /// repositories.
    fn base_sources(&self) -> Result<Vec<String>, Error> {
        let mut sources_list = vec![];
        let url = format!(
            "{}/{}",
            self.options.base_mirror,
            self.buildinfo.snapshot_timestamp()?
        );
        let suite = self.buildinfo.debian_suite()?;
        if self
            .snapshot
            .head_ok(&format!("{}/dists/{}/Release", url, suite))
        {
            sources_list.push(format!("deb {}/ {} main", url, suite));
            sources_list.push(format!("deb-src {}/ unstable main", url));
        }
        if self.options.current_mirror_fallback {
            sources_list.push(format!("deb-src http://deb.debian.org/debian {} main", suite));
        }
        for repo_file in &self.options.extra_repository_files {
            let content = std::fs::read_to_string(repo_file)
                .map_err(|error| Error::RepositoryFile(repo_file.clone(), error))?;
            sources_list.extend(filter_repository_lines(&content));
        }
        Ok(sources_list)
    }

    /// Run the pipeline: setup, build (unless `Builder::None`), verify and
    /// attest.
    pub fn run(&mut self, builder: Builder, output: &Path) -> Result<(), Error> {
        // Predict the buildinfo name the builder will produce, the way
        // dpkg-genbuildinfo names it.
        let artifact_arch = match fixed_artifact_arch(&self.buildinfo).map_err(Error::Build)? {
            Some(token) => token.to_string(),
            None => host_architecture()?,
        };
        let new_buildinfo_path = output.join(format!(
            "{}_{}_{}.buildinfo",
            self.buildinfo.source, self.buildinfo.version, artifact_arch
        ));
        log::debug!("New buildinfo file: {}", new_buildinfo_path.display());
        if new_buildinfo_path.exists() {
            return Err(Error::RefuseOverwrite(new_buildinfo_path));
        }

        // Stage 1: pin the source, set up the ephemeral apt root, select
        // covering snapshot sources. The apt root lives only for this block.
        let record = self
            .snapshot
            .source_record(&self.buildinfo.source, &self.buildinfo.version)?;
        log::debug!(
            "Source package {} first seen {}",
            self.buildinfo.source,
            record.first_seen
        );
        let base_sources = self.base_sources()?;
        let required_sources = {
            let build_arch = self.buildinfo.build_arch.clone();
            // Resolve the snapshot records up front; which architecture
            // indexes the cache needs is only known afterwards.
            for pkg in self.buildinfo.build_depends.iter_mut() {
                if pkg.first_seen.is_none() {
                    self.snapshot.resolve_binary(pkg, &build_arch)?;
                }
            }
            let mut arches = vec![build_arch];
            for pkg in &self.buildinfo.build_depends {
                if let Some(arch) = &pkg.architecture {
                    if arch != "all" && !arches.contains(arch) {
                        arches.push(arch.clone());
                    }
                }
            }
            let root = AptRoot::create(
                &self.tmpdir,
                &self.buildinfo.build_arch,
                self.options.proxy.as_deref(),
                &base_sources,
                &self.options.extra_repository_keys,
            )?;
            let mut cache =
                SnapshotPackageCache::new(root, arches, self.snapshot.http().clone());
            let selected = resolver::resolve(
                &mut self.buildinfo,
                &self.snapshot,
                &mut cache,
                &self.options.base_mirror,
                &base_sources,
            )?;
            selected
                .into_iter()
                .map(|source| source.apt_line)
                .collect::<Vec<_>>()
        };

        // Stage 2: the actual rebuild.
        if builder == Builder::None {
            return Ok(());
        }
        let mut sources_list = base_sources;
        sources_list.extend(required_sources);
        let plan = BuildPlan::new(
            &self.buildinfo,
            sources_list,
            &self.options.base_mirror,
            self.options.extra_repository_keys.clone(),
            self.options.proxy.clone(),
            &self.tmpdir,
        )?;
        plan.run(builder, output)?;

        // Stage 3: compare the produced record against the original and
        // attest the artifacts.
        let text = std::fs::read_to_string(&new_buildinfo_path)
            .map_err(|_| Error::BuildInfoNotFound(new_buildinfo_path.clone()))?;
        let rebuilt: BuildInfo = text.parse()?;
        verify::verify_checksums(&self.buildinfo, &rebuilt)?;
        let products: Vec<String> = rebuilt.checksums.keys().cloned().collect();
        attest::generate_metadata(output, &products, self.options.gpg_sign_keyid.as_deref())?;
        Ok(())
    }
}

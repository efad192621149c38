//! Build plan synthesis and external builder invocation.
//!
//! The resolver's output is turned into the exact command line for one of
//! the supported chroot builders. The builder bootstraps an environment
//! pinned to the selected snapshot sources, installs the pinned build
//! dependencies, fetches and extracts the source package and reruns
//! `dpkg-buildpackage` under the recorded environment.

use crate::buildinfo::BuildInfo;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// What `dpkg-buildpackage` is asked to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    /// Only the source package.
    Source,
    /// Only architecture-independent packages.
    All,
    /// Only architecture-dependent packages.
    Any,
    /// Binary packages.
    Binary,
}

impl std::fmt::Display for BuildMode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(match self {
            BuildMode::Source => "source",
            BuildMode::All => "all",
            BuildMode::Any => "any",
            BuildMode::Binary => "binary",
        })
    }
}

/// Which external tool performs the rebuild.
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builder {
    /// Resolve the environment but do not build.
    None,
    /// Bootstrap a throwaway chroot with mmdebstrap.
    Mmdebstrap,
    /// Drive sbuild.
    Sbuild,
}

/// Errors raised while planning or running the build.
#[derive(Debug)]
pub enum Error {
    /// The `Architecture` field asks for no build at all.
    NothingToBuild,
    /// The plan needed information the buildinfo cannot provide.
    BuildInfo(crate::buildinfo::Error),
    /// The builder executable could not be spawned.
    Spawn {
        /// Builder name.
        builder: &'static str,
        /// The underlying error.
        error: std::io::Error,
    },
    /// The builder exited with a failure status.
    Failed {
        /// Builder name.
        builder: &'static str,
        /// Its exit code.
        code: i32,
    },
    /// The builder was terminated by a signal.
    Interrupted {
        /// Builder name.
        builder: &'static str,
    },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::NothingToBuild => write!(f, "Nothing to build"),
            Error::BuildInfo(error) => write!(f, "{}", error),
            Error::Spawn { builder, error } => write!(f, "Cannot run {}: {}", builder, error),
            Error::Failed { builder, code } => {
                write!(f, "{} failed with exit code {}", builder, code)
            }
            Error::Interrupted { builder } => write!(f, "{} was interrupted", builder),
        }
    }
}

impl std::error::Error for Error {}

impl From<crate::buildinfo::Error> for Error {
    fn from(error: crate::buildinfo::Error) -> Self {
        Error::BuildInfo(error)
    }
}

/// Everything the external builder needs to reproduce the build.
#[derive(Debug, Clone)]
pub struct BuildPlan {
    /// Architecture of the build machine.
    pub build_arch: String,
    /// Architecture the build targets.
    pub host_arch: String,
    /// What `dpkg-buildpackage` is asked to produce.
    pub build_mode: BuildMode,
    /// Whether a source upload was part of the original build.
    pub build_source: bool,
    /// Whether architecture-independent packages were built.
    pub build_archall: bool,
    /// Whether architecture-dependent packages were built.
    pub build_archany: bool,
    /// The full working sources list, base entries and timestamp sources.
    pub sources_list: Vec<String>,
    /// The recorded build environment.
    pub env: BTreeMap<String, String>,
    /// Source package name.
    pub source: String,
    /// Source package version.
    pub source_version: String,
    /// Directory the package must be built in.
    pub build_path: String,
    /// Debian release code name of the base environment.
    pub suite: String,
    /// Snapshot timestamp of the base environment.
    pub snapshot_timestamp: String,
    /// Timestamped package mirror.
    pub base_mirror: String,
    /// Exact apt pins for every installed build dependency.
    pub build_depends: Vec<String>,
    /// Extra keys to trust inside the chroot.
    pub extra_repository_keys: Vec<PathBuf>,
    /// HTTP proxy for apt inside the chroot.
    pub proxy: Option<String>,
    /// Temp directory handed to the builder.
    pub tmpdir: PathBuf,
}

impl BuildPlan {
    /// Assemble the plan for `buildinfo` against the resolved
    /// `sources_list`.
    pub fn new(
        buildinfo: &BuildInfo,
        sources_list: Vec<String>,
        base_mirror: &str,
        extra_repository_keys: Vec<PathBuf>,
        proxy: Option<String>,
        tmpdir: &Path,
    ) -> Result<Self, Error> {
        let build_mode = if !buildinfo.architecture.is_empty() {
            BuildMode::Binary
        } else if buildinfo.build_archall {
            BuildMode::All
        } else if buildinfo.build_source {
            BuildMode::Source
        } else {
            return Err(Error::NothingToBuild);
        };
        let build_depends = buildinfo
            .build_depends
            .iter()
            .map(|pkg| pkg.to_apt_install_format(&buildinfo.build_arch))
            .collect();
        Ok(Self {
            build_arch: buildinfo.build_arch.clone(),
            host_arch: buildinfo.host_arch.clone(),
            build_mode,
            build_source: buildinfo.build_source,
            build_archall: buildinfo.build_archall,
            build_archany: buildinfo.build_archany,
            sources_list,
            env: buildinfo.env.clone(),
            source: buildinfo.source.clone(),
            source_version: buildinfo.version.clone(),
            build_path: buildinfo.build_path.clone(),
            suite: buildinfo.debian_suite()?.to_string(),
            snapshot_timestamp: buildinfo.snapshot_timestamp()?,
            base_mirror: base_mirror.to_string(),
            build_depends,
            extra_repository_keys,
            proxy,
            tmpdir: tmpdir.to_path_buf(),
        })
    }

    /// The recorded environment as `KEY="VALUE"` arguments.
    fn env_args(&self) -> Vec<String> {
        self.env
            .iter()
            .map(|(key, value)| format!("{}=\"{}\"", key, value))
            .collect()
    }

    fn build_path_parent(&self) -> String {
        Path::new(&self.build_path)
            .parent()
            .map(|parent| parent.display().to_string())
            .unwrap_or_else(|| "/".to_string())
    }

    /// The mmdebstrap invocation, with a whitelisted environment: nothing
    /// from the parent leaks into the chroot except `PATH` and `TMPDIR`.
    pub fn mmdebstrap_command(&self, output: &Path) -> Vec<String> {
        let mut cmd = vec![
            "env".to_string(),
            "-i".to_string(),
            "PATH=/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
            format!("TMPDIR={}", self.tmpdir.display()),
            "mmdebstrap".to_string(),
            format!("--arch={}", self.build_arch),
            format!("--include={}", self.build_depends.join(" ")),
            "--variant=apt".to_string(),
            "--aptopt=Acquire::Check-Valid-Until \"false\"".to_string(),
            "--aptopt=Acquire::http::Dl-Limit \"1000\";".to_string(),
            "--aptopt=Acquire::https::Dl-Limit \"1000\";".to_string(),
            "--aptopt=Acquire::Retries \"5\";".to_string(),
            "--aptopt=APT::Get::allow-downgrades \"true\";".to_string(),
        ];
        if let Some(proxy) = &self.proxy {
            cmd.push(format!("--aptopt=Acquire::http::proxy \"{}\";", proxy));
        }
        if !self.extra_repository_keys.is_empty() {
            let keys = self
                .extra_repository_keys
                .iter()
                .map(|key| key.display().to_string())
                .collect::<Vec<_>>()
                .join(" ");
            cmd.push(format!(
                "--essential-hook=copy-in {} /etc/apt/trusted.gpg.d/",
                keys
            ));
        }
        cmd.push(format!(
            "--essential-hook=chroot \"$1\" sh -c \"{}\"",
            [
                "rm /etc/apt/sources.list".to_string(),
                format!(
                    "echo '{}' >> /etc/apt/sources.list",
                    self.sources_list.join("\n")
                ),
                "apt-get update".to_string(),
            ]
            .join(" && ")
        ));
        cmd.push(format!(
            "--customize-hook=chroot \"$1\" sh -c \"{}\"",
            [
                format!(
                    "apt-get source --only-source -d {}={}",
                    self.source, self.source_version
                ),
                format!("mkdir -p {}", self.build_path_parent()),
                format!("dpkg-source --no-check -x /*.dsc {}", self.build_path),
                format!("cd {}", self.build_path),
                format!(
                    "env {} dpkg-buildpackage -uc -a {} --build={}",
                    self.env_args().join(" "),
                    self.host_arch,
                    self.build_mode
                ),
            ]
            .join(" && ")
        ));
        cmd.push(format!(
            "--customize-hook=sync-out {} {}",
            self.build_path_parent(),
            output.display()
        ));
        cmd.push(self.suite.clone());
        cmd.push("/dev/null".to_string());
        cmd.push(format!(
            "deb {}/{}/ {} main",
            self.base_mirror, self.snapshot_timestamp, self.suite
        ));
        cmd
    }

    /// The sbuild invocation.
    pub fn sbuild_command(&self, output: &Path) -> Vec<String> {
        let mut cmd = vec![
            "sudo".to_string(),
            "env".to_string(),
            format!("--chdir={}", output.display()),
        ];
        cmd.extend(self.env_args());
        cmd.push("sbuild".to_string());
        cmd.push("-D".to_string());
        for repo in &self.sources_list {
            cmd.push(format!(
                "--extra-repository={}",
                shlex::try_quote(repo).unwrap()
            ));
        }
        cmd.push(
            "--chroot-setup-commands=echo Acquire::Check-Valid-Until \"false\"\n\
             --aptopt=Acquire::http::Dl-Limit \"1000\";\n\
             --aptopt=Acquire::https::Dl-Limit \"1000\";\n\
             --aptopt=Acquire::Retries \"5\";\n\
             --aptopt=APT::Get::allow-downgrades \"true\"; \
             | tee /etc/apt/apt.conf.d/23-debrebuild.conf"
                .to_string(),
        );
        cmd.push(
            "--chroot-setup-commands=apt-get --yes remove build-essential libc6-dev gcc g++ make dpkg-dev"
                .to_string(),
        );
        cmd.push("--chroot-setup-commands=apt-get --yes autoremove".to_string());
        cmd.push(format!("--add-depends={}", self.build_depends.join(" ")));
        cmd.push(format!("--build={}", self.build_arch));
        cmd.push(format!("--host={}", self.host_arch));
        cmd.push((if self.build_source { "--source" } else { "--no-source" }).to_string());
        cmd.push((if self.build_archany { "--arch-any" } else { "--no-arch-any" }).to_string());
        cmd.push((if self.build_archall { "--arch-all" } else { "--no-arch-all" }).to_string());
        cmd.push(format!("--dist={}", self.suite));
        cmd.push("--no-run-lintian".to_string());
        cmd.push("--no-run-autopkgtest".to_string());
        cmd.push("--no-apt-upgrade".to_string());
        cmd.push("--no-apt-distupgrade".to_string());
        cmd.push("--bd-uninstallable-explainer=".to_string());
        cmd.push("--build-dep-resolver=aspcud".to_string());
        cmd.push(format!("--build-path={}", self.build_path));
        cmd.push(format!("{}_{}", self.source, self.source_version));
        cmd
    }

    /// Run the chosen builder, blocking until it finishes. `Builder::None`
    /// is a no-op.
    pub fn run(&self, builder: Builder, output: &Path) -> Result<(), Error> {
        let (name, command): (&'static str, Vec<String>) = match builder {
            Builder::None => return Ok(()),
            Builder::Mmdebstrap => ("mmdebstrap", self.mmdebstrap_command(output)),
            Builder::Sbuild => ("sbuild", self.sbuild_command(output)),
        };
        log::debug!("{}", command.join(" "));
        let status = std::process::Command::new(&command[0])
            .args(&command[1..])
            .status()
            .map_err(|error| Error::Spawn {
                builder: name,
                error,
            })?;
        if status.success() {
            return Ok(());
        }
        match status.code() {
            Some(code) => Err(Error::Failed {
                builder: name,
                code,
            }),
            None => Err(Error::Interrupted { builder: name }),
        }
    }
}

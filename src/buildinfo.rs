//! Parsing of Debian `.buildinfo` control files.
//!
//! A `.buildinfo` file records the source package, the produced binaries, the
//! exact versions of every installed build dependency, the build environment
//! and the checksums of all artifacts of a past build. This module turns that
//! control-file dialect into a typed model which the snapshot client and the
//! dependency resolver operate on.

use debversion::Version;
use rand::Rng;
use std::collections::BTreeMap;
use std::str::FromStr;

/// Mapping from `base-files` major versions to Debian release code names.
const DEBIAN_RELEASES: &[(&str, &str)] = &[
    ("6", "squeeze"),
    ("7", "wheezy"),
    ("8", "jessie"),
    ("9", "stretch"),
    ("10", "buster"),
    ("11", "bullseye"),
    ("12", "bookworm"),
];

/// Errors raised while parsing or interpreting a `.buildinfo` file.
#[derive(Debug)]
pub enum Error {
    /// A field value does not follow the expected grammar.
    InvalidField {
        /// Name of the offending field.
        field: String,
        /// The value or line that failed to parse.
        value: String,
    },
    /// A required field is absent.
    MissingRequired(&'static str),
    /// More than one concrete architecture was listed in `Architecture`.
    MultipleArch(Vec<String>),
    /// The `base-files` build dependency maps to no known Debian release.
    UnknownBaseFiles(Option<Version>),
    /// A date could not be parsed.
    BadDate(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::InvalidField { field, value } => {
                write!(f, "Cannot parse {} entry: {}", field, value)
            }
            Error::MissingRequired(field) => write!(f, "Need {} field", field),
            Error::MultipleArch(arches) => write!(
                f,
                "More than one architecture in Architecture field: {}",
                arches.join(" ")
            ),
            Error::UnknownBaseFiles(Some(version)) => {
                write!(f, "Cannot determine Debian release from base-files {}", version)
            }
            Error::UnknownBaseFiles(None) => {
                write!(f, "No base-files among the installed build dependencies")
            }
            Error::BadDate(date) => write!(f, "Cannot parse date: {}", date),
        }
    }
}

impl std::error::Error for Error {}

/// A binary package pinned to an exact version.
///
/// `architecture`, `first_seen` and `hash` start out as whatever the
/// `.buildinfo` recorded (usually nothing) and are filled in by the snapshot
/// client during resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct Package {
    /// Binary package name.
    pub name: String,
    /// Exact pinned version.
    pub version: Version,
    /// Architecture, once known.
    pub architecture: Option<String>,
    /// Earliest timestamp at which the snapshot archive saw this package.
    pub first_seen: Option<String>,
    /// Hash of the package file in the snapshot archive.
    pub hash: Option<String>,
}

impl Package {
    /// Create a package pin without architecture information.
    pub fn new(name: &str, version: Version) -> Self {
        Self {
            name: name.to_string(),
            version,
            architecture: None,
            first_seen: None,
            hash: None,
        }
    }

    /// Format the pin the way apt expects it on an install command line.
    ///
    /// Native and `all` packages become `name=version`, foreign-architecture
    /// packages `name:arch=version`.
    pub fn to_apt_install_format(&self, build_arch: &str) -> String {
        match self.architecture.as_deref() {
            Some(arch) if arch != "all" && arch != build_arch => {
                format!("{}:{}={}", self.name, arch, self.version)
            }
            _ => format!("{}={}", self.name, self.version),
        }
    }
}

impl std::fmt::Display for Package {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} (= {})", self.name, self.version)
    }
}

/// Recorded size and digests of one produced artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChecksums {
    /// File size in bytes.
    pub size: u64,
    /// Digests keyed by lowercase algorithm name (`md5`, `sha1`, `sha256`).
    pub digests: BTreeMap<String, String>,
}

/// The parsed record of a past package build.
#[derive(Debug, Clone)]
pub struct BuildInfo {
    /// Source package name.
    pub source: String,
    /// Source package version.
    pub version: String,
    /// Concrete architectures from the `Architecture` field, after the
    /// `source` and `all` tokens have been extracted. At most one entry.
    pub architecture: Vec<String>,
    /// Whether `source` appeared in the `Architecture` field.
    pub build_source: bool,
    /// Whether `all` appeared in the `Architecture` field.
    pub build_archall: bool,
    /// Whether a concrete architecture remained after filtering.
    pub build_archany: bool,
    /// Names of the binary packages that were built.
    pub binary: Vec<String>,
    /// Architecture of the build machine.
    pub build_arch: String,
    /// Architecture the build targeted. Defaults to `build_arch`.
    pub host_arch: String,
    /// Directory the package was built in.
    pub build_path: String,
    /// RFC 2822 date of the build.
    pub build_date: String,
    /// Recorded artifact checksums, aggregated over all `Checksums-*` fields.
    pub checksums: BTreeMap<String, FileChecksums>,
    /// The installed build dependencies, each pinned to an exact version,
    /// in input order.
    pub build_depends: Vec<Package>,
    /// The build environment variables.
    pub env: BTreeMap<String, String>,
}

impl BuildInfo {
    /// The Debian release code name this build ran against, derived from the
    /// major version of the `base-files` build dependency.
    pub fn debian_suite(&self) -> Result<&'static str, Error> {
        let base_files = self
            .build_depends
            .iter()
            .find(|pkg| pkg.name == "base-files")
            .ok_or(Error::UnknownBaseFiles(None))?;
        let major: String = base_files
            .version
            .upstream_version
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        DEBIAN_RELEASES
            .iter()
            .find(|(version, _)| *version == major)
            .map(|(_, suite)| *suite)
            .ok_or_else(|| Error::UnknownBaseFiles(Some(base_files.version.clone())))
    }

    /// The build date as a `YYYYMMDDTHHMMSSZ` snapshot archive path segment.
    pub fn snapshot_timestamp(&self) -> Result<String, Error> {
        to_snapshot_timestamp(&self.build_date)
    }
}

/// Normalize a date to the `YYYYMMDDTHHMMSSZ` UTC form used in snapshot
/// archive paths. Accepts RFC 2822 dates as found in `Build-Date` as well as
/// already-normalized timestamps as returned by the snapshot metadata API.
pub fn to_snapshot_timestamp(date: &str) -> Result<String, Error> {
    if let Ok(parsed) = chrono::DateTime::parse_from_rfc2822(date) {
        return Ok(parsed
            .with_timezone(&chrono::Utc)
            .format("%Y%m%dT%H%M%SZ")
            .to_string());
    }
    if let Ok(parsed) = chrono::NaiveDateTime::parse_from_str(date, "%Y%m%dT%H%M%SZ") {
        return Ok(parsed.format("%Y%m%dT%H%M%SZ").to_string());
    }
    Err(Error::BadDate(date.to_string()))
}

/// Parse one `Installed-Build-Depends` entry, e.g.
/// `g++-mingw-w64-x86-64 (= 8.3.0-26+21.5+b1)`.
fn parse_build_depends_entry(line: &str) -> Option<Package> {
    let (_, name, version) = lazy_regex::regex_captures!(r"^(.*) \(= (.*)\),?$", line)?;
    let version: Version = version.trim().parse().ok()?;
    Some(Package::new(name.trim(), version))
}

/// Split a folded field value into its non-empty, trimmed lines.
fn folded_lines(value: &str) -> impl Iterator<Item = &str> {
    value.lines().map(str::trim).filter(|line| !line.is_empty())
}

impl FromStr for BuildInfo {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        // Relaxed parsing: an inline OpenPGP signature wraps the control
        // paragraph in armor lines that are not Field: value pairs.
        let (control, _errors) = deb822_lossless::Deb822::from_str_relaxed(text);

        let mut source = None;
        let mut version = None;
        let mut arch_tokens: Vec<String> = vec![];
        let mut binary = vec![];
        let mut build_path = None;
        let mut build_arch = None;
        let mut build_date = None;
        let mut host_arch = None;
        let mut checksums: BTreeMap<String, FileChecksums> = BTreeMap::new();
        let mut build_depends = vec![];
        let mut env = BTreeMap::new();

        for paragraph in control.paragraphs() {
            for (field, value) in paragraph.items() {
                match field.as_str() {
                    "Source" => source = Some(value.trim().to_string()),
                    "Architecture" => {
                        arch_tokens = value.split_whitespace().map(str::to_string).collect()
                    }
                    "Binary" => {
                        binary = value.split_whitespace().map(str::to_string).collect()
                    }
                    "Version" => version = Some(value.trim().to_string()),
                    "Build-Path" => build_path = Some(value.trim().to_string()),
                    "Build-Architecture" => build_arch = Some(value.trim().to_string()),
                    "Build-Date" => build_date = Some(value.trim().to_string()),
                    "Host-Architecture" => host_arch = Some(value.trim().to_string()),
                    name if name.starts_with("Checksums-") => {
                        let alg = name["Checksums-".len()..].to_lowercase();
                        for line in folded_lines(&value) {
                            merge_checksum_line(&mut checksums, &field, &alg, line)?;
                        }
                    }
                    "Installed-Build-Depends" => {
                        for line in folded_lines(&value) {
                            let pkg = parse_build_depends_entry(line).ok_or_else(|| {
                                Error::InvalidField {
                                    field: field.clone(),
                                    value: line.to_string(),
                                }
                            })?;
                            build_depends.push(pkg);
                        }
                    }
                    "Environment" => {
                        for line in folded_lines(&value) {
                            let (_, key, val) =
                                lazy_regex::regex_captures!(r#"^([^=]+)="(.*)"$"#, line)
                                    .ok_or_else(|| Error::InvalidField {
                                        field: field.clone(),
                                        value: line.to_string(),
                                    })?;
                            env.insert(key.trim().to_string(), val.to_string());
                        }
                    }
                    // Unknown fields are ignored for forward compatibility.
                    _ => {}
                }
            }
        }

        let build_source = arch_tokens.iter().any(|arch| arch == "source");
        let build_archall = arch_tokens.iter().any(|arch| arch == "all");
        let architecture: Vec<String> = arch_tokens
            .into_iter()
            .filter(|arch| arch != "source" && arch != "all")
            .collect();
        if architecture.len() > 1 {
            return Err(Error::MultipleArch(architecture));
        }
        let build_archany = architecture.len() == 1;

        let source = source.ok_or(Error::MissingRequired("Source"))?;
        let version = version.ok_or(Error::MissingRequired("Version"))?;
        let build_arch = build_arch.ok_or(Error::MissingRequired("Build-Architecture"))?;
        let build_date = build_date.ok_or(Error::MissingRequired("Build-Date"))?;
        let host_arch = host_arch.unwrap_or_else(|| build_arch.clone());
        let build_path = build_path.unwrap_or_else(|| {
            let suffix: String = (0..8)
                .map(|_| rand::thread_rng().sample(rand::distributions::Alphanumeric) as char)
                .collect();
            format!("/build/{}-{}", source, suffix)
        });

        Ok(BuildInfo {
            source,
            version,
            architecture,
            build_source,
            build_archall,
            build_archany,
            binary,
            build_arch,
            host_arch,
            build_path,
            build_date,
            checksums,
            build_depends,
            env,
        })
    }
}

/// Merge one `hash size filename` line into the aggregated checksum map,
/// checking that the size agrees with any other `Checksums-*` block that
/// already listed the file.
fn merge_checksum_line(
    checksums: &mut BTreeMap<String, FileChecksums>,
    field: &str,
    alg: &str,
    line: &str,
) -> Result<(), Error> {
    let invalid = || Error::InvalidField {
        field: field.to_string(),
        value: line.to_string(),
    };
    let mut tokens = line.split_whitespace();
    let hash = tokens.next().ok_or_else(invalid)?;
    let size: u64 = tokens
        .next()
        .ok_or_else(invalid)?
        .parse()
        .map_err(|_| invalid())?;
    let filename = tokens.next().ok_or_else(invalid)?;
    if tokens.next().is_some() {
        return Err(invalid());
    }
    match checksums.entry(filename.to_string()) {
        std::collections::btree_map::Entry::Occupied(mut entry) => {
            if entry.get().size != size {
                return Err(invalid());
            }
            entry
                .get_mut()
                .digests
                .insert(alg.to_string(), hash.to_string());
        }
        std::collections::btree_map::Entry::Vacant(entry) => {
            entry.insert(FileChecksums {
                size,
                digests: BTreeMap::from([(alg.to_string(), hash.to_string())]),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_BUILDINFO: &str = r#"Format: 1.0
Source: hello
Binary: hello
Architecture: amd64
Version: 2.10-2
Checksums-Md5:
 271efa714ee5daa2e9eeb3b8a05b79b1 52428 hello_2.10-2_amd64.deb
Checksums-Sha1:
 4e6ed5445e2a4a3b7f64a26d6cbb020e8d4e522e 52428 hello_2.10-2_amd64.deb
Checksums-Sha256:
 98a42a521e20dcf5c33bc2de38e03312b434ef4d85d96a04df0410d9bf87fa45 52428 hello_2.10-2_amd64.deb
Build-Origin: Debian
Build-Architecture: amd64
Build-Date: Tue, 04 May 2021 12:00:00 +0000
Installed-Build-Depends:
 base-files (= 11.1),
 dpkg-dev (= 1.20.9),
 libc6 (= 2.31-13)
Environment:
 DEB_BUILD_OPTIONS="parallel=4"
 LANG="C.UTF-8"
 SOURCE_DATE_EPOCH="1620129600"
"#;

    #[test]
    fn test_parse_minimal() {
        let buildinfo: BuildInfo = HELLO_BUILDINFO.parse().unwrap();
        assert_eq!(buildinfo.source, "hello");
        assert_eq!(buildinfo.version, "2.10-2");
        assert_eq!(buildinfo.binary, vec!["hello"]);
        assert_eq!(buildinfo.architecture, vec!["amd64"]);
        assert!(!buildinfo.build_source);
        assert!(!buildinfo.build_archall);
        assert!(buildinfo.build_archany);
        assert_eq!(buildinfo.build_arch, "amd64");
        assert_eq!(buildinfo.host_arch, "amd64");
        assert_eq!(buildinfo.build_depends.len(), 3);
        assert_eq!(buildinfo.build_depends[0].name, "base-files");
        assert_eq!(
            buildinfo.build_depends[2].version,
            "2.31-13".parse::<Version>().unwrap()
        );
        assert_eq!(buildinfo.env["DEB_BUILD_OPTIONS"], "parallel=4");
        assert_eq!(buildinfo.env["SOURCE_DATE_EPOCH"], "1620129600");
    }

    #[test]
    fn test_checksums_merged_across_blocks() {
        let buildinfo: BuildInfo = HELLO_BUILDINFO.parse().unwrap();
        let entry = &buildinfo.checksums["hello_2.10-2_amd64.deb"];
        assert_eq!(entry.size, 52428);
        assert_eq!(
            entry.digests.keys().collect::<Vec<_>>(),
            vec!["md5", "sha1", "sha256"]
        );
        assert_eq!(
            entry.digests["sha256"],
            "98a42a521e20dcf5c33bc2de38e03312b434ef4d85d96a04df0410d9bf87fa45"
        );
    }

    #[test]
    fn test_checksums_size_disagreement() {
        let text = HELLO_BUILDINFO.replace(
            "4e6ed5445e2a4a3b7f64a26d6cbb020e8d4e522e 52428",
            "4e6ed5445e2a4a3b7f64a26d6cbb020e8d4e522e 52429",
        );
        assert!(matches!(
            text.parse::<BuildInfo>(),
            Err(Error::InvalidField { .. })
        ));
    }

    #[test]
    fn test_architecture_flags() {
        let text = HELLO_BUILDINFO.replace(
            "\nArchitecture: amd64\n",
            "\nArchitecture: source all amd64\n",
        );
        let buildinfo: BuildInfo = text.parse().unwrap();
        assert!(buildinfo.build_source);
        assert!(buildinfo.build_archall);
        assert!(buildinfo.build_archany);
        assert_eq!(buildinfo.architecture, vec!["amd64"]);
    }

    #[test]
    fn test_multiple_concrete_architectures() {
        let text =
            HELLO_BUILDINFO.replace("\nArchitecture: amd64\n", "\nArchitecture: amd64 i386\n");
        assert!(matches!(
            text.parse::<BuildInfo>(),
            Err(Error::MultipleArch(_))
        ));
    }

    #[test]
    fn test_missing_build_architecture() {
        let text = HELLO_BUILDINFO.replace("Build-Architecture: amd64\n", "");
        assert!(matches!(
            text.parse::<BuildInfo>(),
            Err(Error::MissingRequired("Build-Architecture"))
        ));
    }

    #[test]
    fn test_default_build_path() {
        let buildinfo: BuildInfo = HELLO_BUILDINFO.parse().unwrap();
        assert!(buildinfo.build_path.starts_with("/build/hello-"));
    }

    #[test]
    fn test_explicit_build_path() {
        let text = HELLO_BUILDINFO.to_string() + "Build-Path: /build/hello-abc123\n";
        let buildinfo: BuildInfo = text.parse().unwrap();
        assert_eq!(buildinfo.build_path, "/build/hello-abc123");
    }

    #[test]
    fn test_host_architecture_default_and_override() {
        let buildinfo: BuildInfo = HELLO_BUILDINFO.parse().unwrap();
        assert_eq!(buildinfo.host_arch, buildinfo.build_arch);
        let text = HELLO_BUILDINFO.to_string() + "Host-Architecture: arm64\n";
        let buildinfo: BuildInfo = text.parse().unwrap();
        assert_eq!(buildinfo.host_arch, "arm64");
    }

    #[test]
    fn test_build_depends_exact_pin() {
        let pkg = parse_build_depends_entry("g++-mingw-w64-x86-64 (= 8.3.0-26+21.5+b1),").unwrap();
        assert_eq!(pkg.name, "g++-mingw-w64-x86-64");
        assert_eq!(pkg.version, "8.3.0-26+21.5+b1".parse::<Version>().unwrap());
        assert_eq!(pkg.architecture, None);
    }

    #[test]
    fn test_malformed_build_depends() {
        let text = HELLO_BUILDINFO.replace("base-files (= 11.1),", "base-files 11.1,");
        assert!(matches!(
            text.parse::<BuildInfo>(),
            Err(Error::InvalidField { .. })
        ));
    }

    #[test]
    fn test_malformed_environment() {
        let text = HELLO_BUILDINFO.replace(
            "LANG=\"C.UTF-8\"",
            "LANG=C.UTF-8",
        );
        assert!(matches!(
            text.parse::<BuildInfo>(),
            Err(Error::InvalidField { .. })
        ));
    }

    #[test]
    fn test_debian_suite() {
        let buildinfo: BuildInfo = HELLO_BUILDINFO.parse().unwrap();
        assert_eq!(buildinfo.debian_suite().unwrap(), "bullseye");
    }

    #[test]
    fn test_debian_suite_unknown_version() {
        let text = HELLO_BUILDINFO.replace("base-files (= 11.1)", "base-files (= 99)");
        let buildinfo: BuildInfo = text.parse().unwrap();
        assert!(matches!(
            buildinfo.debian_suite(),
            Err(Error::UnknownBaseFiles(Some(_)))
        ));
    }

    #[test]
    fn test_debian_suite_missing_base_files() {
        let text = HELLO_BUILDINFO.replace(" base-files (= 11.1),\n", "");
        let buildinfo: BuildInfo = text.parse().unwrap();
        assert!(matches!(
            buildinfo.debian_suite(),
            Err(Error::UnknownBaseFiles(None))
        ));
    }

    #[test]
    fn test_snapshot_timestamp() {
        let buildinfo: BuildInfo = HELLO_BUILDINFO.parse().unwrap();
        assert_eq!(buildinfo.snapshot_timestamp().unwrap(), "20210504T120000Z");
    }

    #[test]
    fn test_snapshot_timestamp_passthrough() {
        assert_eq!(
            to_snapshot_timestamp("20210504T120000Z").unwrap(),
            "20210504T120000Z"
        );
        assert!(matches!(
            to_snapshot_timestamp("yesterday"),
            Err(Error::BadDate(_))
        ));
    }

    #[test]
    fn test_apt_install_format() {
        let mut pkg = Package::new("libc6", "2.31-13".parse().unwrap());
        pkg.architecture = Some("amd64".to_string());
        assert_eq!(pkg.to_apt_install_format("amd64"), "libc6=2.31-13");
        pkg.architecture = Some("all".to_string());
        assert_eq!(pkg.to_apt_install_format("amd64"), "libc6=2.31-13");
        pkg.architecture = Some("i386".to_string());
        assert_eq!(pkg.to_apt_install_format("amd64"), "libc6:i386=2.31-13");
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let text = HELLO_BUILDINFO.to_string() + "Build-Kernel-Version: 5.10.0\n";
        assert!(text.parse::<BuildInfo>().is_ok());
    }
}

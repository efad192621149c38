//! Selection of snapshot sources covering the pinned build dependencies.
//!
//! Every build dependency carries an exact version pin and, after snapshot
//! resolution, the timestamp under which the archive first saw it. Packages
//! sharing a timestamp can be installed from one snapshot source, so the
//! resolver buckets them, then greedily picks sources by descending coverage
//! until the package cache confirms every pin is installable.

use crate::apt;
use crate::buildinfo::{to_snapshot_timestamp, BuildInfo, Package};
use crate::snapshot;
use crate::snapshot::SnapshotClient;
use crate::sources::snapshot_source_line;
use debversion::Version;

/// Errors raised during dependency resolution.
#[derive(Debug)]
pub enum Error {
    /// A snapshot lookup failed.
    Snapshot(snapshot::Error),
    /// The package cache failed to refresh.
    Cache(apt::Error),
    /// A first-seen timestamp could not be normalized.
    Date(crate::buildinfo::Error),
    /// Some packages could not be located in any candidate source.
    Unresolved(Vec<String>),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Snapshot(error) => write!(f, "{}", error),
            Error::Cache(error) => write!(f, "{}", error),
            Error::Date(error) => write!(f, "{}", error),
            Error::Unresolved(packages) => write!(
                f,
                "Cannot locate the following packages via snapshots or the current repo/mirror: {}",
                packages.join(" ")
            ),
        }
    }
}

impl std::error::Error for Error {}

/// Fills in the snapshot archive's view of a pinned binary package.
///
/// [`SnapshotClient`] is the production implementation; tests substitute
/// their own.
pub trait BinaryResolver {
    /// Populate `architecture`, `first_seen` and `hash` of `pkg`.
    fn resolve_binary(&self, pkg: &mut Package, build_arch: &str) -> Result<(), snapshot::Error>;
}

impl BinaryResolver for SnapshotClient {
    fn resolve_binary(&self, pkg: &mut Package, build_arch: &str) -> Result<(), snapshot::Error> {
        SnapshotClient::resolve_binary(self, pkg, build_arch)
    }
}

/// Answers whether apt, configured with a set of sources, sees an exact
/// package version. The contract the greedy selection relies on; injected so
/// the apt machinery stays replaceable.
pub trait PackageCache {
    /// Bring the cache in line with `sources` (the full working list).
    fn refresh(&mut self, sources: &[String]) -> Result<(), apt::Error>;
    /// Whether `(name, version, architecture)` is installable.
    fn contains(&self, name: &str, version: &Version, architecture: &str) -> bool;
}

impl PackageCache for apt::SnapshotPackageCache {
    fn refresh(&mut self, sources: &[String]) -> Result<(), apt::Error> {
        apt::SnapshotPackageCache::refresh(self, sources)
    }

    fn contains(&self, name: &str, version: &Version, architecture: &str) -> bool {
        apt::SnapshotPackageCache::contains(self, name, version, architecture)
    }
}

/// A snapshot source chosen by the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedSource {
    /// The sources.list line.
    pub apt_line: String,
    /// Indices into `build_depends` of the packages this source hosts.
    pub covers: Vec<usize>,
}

/// Resolve every build dependency of `buildinfo` to a minimal covering set
/// of snapshot sources.
///
/// `base_sources` is the working sources list the candidates are appended
/// to; a dependency already installable from it is not required to come from
/// a timestamp source.
pub fn resolve(
    buildinfo: &mut BuildInfo,
    snapshot: &dyn BinaryResolver,
    cache: &mut dyn PackageCache,
    base_mirror: &str,
    base_sources: &[String],
) -> Result<Vec<SelectedSource>, Error> {
    let build_arch = buildinfo.build_arch.clone();

    let mut timestamps = Vec::with_capacity(buildinfo.build_depends.len());
    for pkg in buildinfo.build_depends.iter_mut() {
        if pkg.first_seen.is_none() {
            snapshot
                .resolve_binary(pkg, &build_arch)
                .map_err(Error::Snapshot)?;
        }
        let first_seen = pkg.first_seen.clone().unwrap_or_default();
        timestamps.push(to_snapshot_timestamp(&first_seen).map_err(Error::Date)?);
    }

    // Bucket by timestamp; first appearance in input order breaks ties when
    // coverage counts are equal.
    let mut buckets: Vec<(String, Vec<usize>)> = Vec::new();
    for (index, timestamp) in timestamps.iter().enumerate() {
        if let Some(bucket) = buckets.iter_mut().find(|bucket| &bucket.0 == timestamp) {
            bucket.1.push(index);
        } else {
            buckets.push((timestamp.clone(), vec![index]));
        }
    }
    buckets.sort_by(|a, b| b.1.len().cmp(&a.1.len()));

    let mut notfound: Vec<usize> = (0..buildinfo.build_depends.len()).collect();
    let mut working: Vec<String> = base_sources.to_vec();
    let mut selected = Vec::new();
    for (timestamp, covers) in buckets {
        if notfound.is_empty() {
            break;
        }
        let line = snapshot_source_line(base_mirror, &timestamp);
        if !covers.iter().any(|index| notfound.contains(index)) {
            log::info!("Skipping snapshot: {}", line);
            continue;
        }
        log::info!("Remaining packages to be found: {}", notfound.len());
        log::debug!("Timestamp source ({} packages): {}", covers.len(), line);
        working.push(line.clone());
        cache.refresh(&working).map_err(Error::Cache)?;
        notfound.retain(|&index| {
            let pkg = &buildinfo.build_depends[index];
            let arch = pkg.architecture.as_deref().unwrap_or(&build_arch);
            !cache.contains(&pkg.name, &pkg.version, arch)
        });
        selected.push(SelectedSource {
            apt_line: line,
            covers,
        });
    }

    if !notfound.is_empty() {
        let missing = notfound
            .iter()
            .map(|&index| buildinfo.build_depends[index].name.clone())
            .collect();
        return Err(Error::Unresolved(missing));
    }
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    /// Hands out canned first-seen timestamps.
    struct StubResolver {
        first_seen: HashMap<String, String>,
    }

    impl BinaryResolver for StubResolver {
        fn resolve_binary(
            &self,
            pkg: &mut Package,
            build_arch: &str,
        ) -> Result<(), snapshot::Error> {
            match self.first_seen.get(&pkg.name) {
                Some(first_seen) => {
                    pkg.first_seen = Some(first_seen.clone());
                    pkg.hash = Some(format!("hash-{}", pkg.name));
                    if pkg.architecture.is_none() {
                        pkg.architecture = Some(build_arch.to_string());
                    }
                    Ok(())
                }
                None => Err(snapshot::Error::NoBinaryFound(pkg.name.clone())),
            }
        }
    }

    /// Knows which records each sources line publishes.
    struct StubCache {
        published: HashMap<String, Vec<(String, String, String)>>,
        records: HashSet<(String, String, String)>,
    }

    impl StubCache {
        fn new(published: HashMap<String, Vec<(String, String, String)>>) -> Self {
            Self {
                published,
                records: HashSet::new(),
            }
        }
    }

    impl PackageCache for StubCache {
        fn refresh(&mut self, sources: &[String]) -> Result<(), apt::Error> {
            for line in sources {
                for record in self.published.get(line).into_iter().flatten() {
                    self.records.insert(record.clone());
                }
            }
            Ok(())
        }

        fn contains(&self, name: &str, version: &Version, architecture: &str) -> bool {
            self.records.contains(&(
                name.to_string(),
                version.to_string(),
                architecture.to_string(),
            ))
        }
    }

    const MIRROR: &str = "http://snapshot.debian.org/archive/debian";

    fn buildinfo_with_depends(depends: &[(&str, &str)]) -> BuildInfo {
        let mut text = String::from(
            "Source: hello\nVersion: 2.10-2\nArchitecture: amd64\n\
             Build-Architecture: amd64\n\
             Build-Date: Tue, 04 May 2021 12:00:00 +0000\n\
             Installed-Build-Depends:\n",
        );
        for (name, version) in depends {
            text.push_str(&format!(" {} (= {}),\n", name, version));
        }
        text.parse().unwrap()
    }

    fn record(name: &str, version: &str) -> (String, String, String) {
        (name.to_string(), version.to_string(), "amd64".to_string())
    }

    #[test]
    fn test_coverage_ordering() {
        // Nine packages share one timestamp, a tenth lives elsewhere; the
        // bigger bucket must be selected first and both must suffice.
        let names: Vec<String> = (0..10).map(|i| format!("pkg{}", i)).collect();
        let mut buildinfo = buildinfo_with_depends(
            &names
                .iter()
                .map(|name| (name.as_str(), "1.0-1"))
                .collect::<Vec<_>>(),
        );
        let mut first_seen = HashMap::new();
        for name in &names[..9] {
            first_seen.insert(name.clone(), "20210504T120000Z".to_string());
        }
        first_seen.insert(names[9].clone(), "20210601T000000Z".to_string());
        let resolver = StubResolver { first_seen };

        let line1 = snapshot_source_line(MIRROR, "20210504T120000Z");
        let line2 = snapshot_source_line(MIRROR, "20210601T000000Z");
        let mut published = HashMap::new();
        published.insert(
            line1.clone(),
            names[..9].iter().map(|name| record(name, "1.0-1")).collect(),
        );
        published.insert(line2.clone(), vec![record(&names[9], "1.0-1")]);
        let mut cache = StubCache::new(published);

        let selected = resolve(&mut buildinfo, &resolver, &mut cache, MIRROR, &[]).unwrap();
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].apt_line, line1);
        assert_eq!(selected[0].covers.len(), 9);
        assert_eq!(selected[1].apt_line, line2);
        assert_eq!(selected[1].covers, vec![9]);
    }

    #[test]
    fn test_covered_union_contains_every_dependency() {
        let mut buildinfo = buildinfo_with_depends(&[("a", "1.0"), ("b", "2.0"), ("c", "3.0")]);
        let mut first_seen = HashMap::new();
        first_seen.insert("a".to_string(), "20210504T120000Z".to_string());
        first_seen.insert("b".to_string(), "20210504T120000Z".to_string());
        first_seen.insert("c".to_string(), "20210601T000000Z".to_string());
        let resolver = StubResolver { first_seen };
        let mut published = HashMap::new();
        published.insert(
            snapshot_source_line(MIRROR, "20210504T120000Z"),
            vec![record("a", "1.0"), record("b", "2.0")],
        );
        published.insert(
            snapshot_source_line(MIRROR, "20210601T000000Z"),
            vec![record("c", "3.0")],
        );
        let mut cache = StubCache::new(published);
        let selected = resolve(&mut buildinfo, &resolver, &mut cache, MIRROR, &[]).unwrap();
        let mut covered: Vec<usize> = selected.iter().flat_map(|s| s.covers.clone()).collect();
        covered.sort();
        assert_eq!(covered, vec![0, 1, 2]);
    }

    #[test]
    fn test_candidate_without_remaining_coverage_is_skipped() {
        // The base source already publishes c, so c's own timestamp source
        // must be skipped once the first candidate's refresh has seen it.
        let mut buildinfo = buildinfo_with_depends(&[("a", "1.0"), ("b", "2.0"), ("c", "3.0")]);
        let mut first_seen = HashMap::new();
        first_seen.insert("a".to_string(), "20210504T120000Z".to_string());
        first_seen.insert("b".to_string(), "20210504T120000Z".to_string());
        first_seen.insert("c".to_string(), "20210601T000000Z".to_string());
        let resolver = StubResolver { first_seen };

        let base = "deb http://snapshot.debian.org/archive/debian/20210504T120000Z/ bullseye main"
            .to_string();
        let mut published = HashMap::new();
        published.insert(base.clone(), vec![record("c", "3.0")]);
        published.insert(
            snapshot_source_line(MIRROR, "20210504T120000Z"),
            vec![record("a", "1.0"), record("b", "2.0")],
        );
        published.insert(
            snapshot_source_line(MIRROR, "20210601T000000Z"),
            vec![record("c", "3.0")],
        );
        let mut cache = StubCache::new(published);
        let selected = resolve(
            &mut buildinfo,
            &resolver,
            &mut cache,
            MIRROR,
            std::slice::from_ref(&base),
        )
        .unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(
            selected[0].apt_line,
            snapshot_source_line(MIRROR, "20210504T120000Z")
        );
    }

    #[test]
    fn test_unresolved_dependencies_reported() {
        let mut buildinfo = buildinfo_with_depends(&[("a", "1.0"), ("ghost", "9.9")]);
        let mut first_seen = HashMap::new();
        first_seen.insert("a".to_string(), "20210504T120000Z".to_string());
        first_seen.insert("ghost".to_string(), "20210504T120000Z".to_string());
        let resolver = StubResolver { first_seen };
        let mut published = HashMap::new();
        published.insert(
            snapshot_source_line(MIRROR, "20210504T120000Z"),
            vec![record("a", "1.0")],
        );
        let mut cache = StubCache::new(published);
        match resolve(&mut buildinfo, &resolver, &mut cache, MIRROR, &[]) {
            Err(Error::Unresolved(missing)) => assert_eq!(missing, vec!["ghost"]),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_snapshot_lookup_failure_propagates() {
        let mut buildinfo = buildinfo_with_depends(&[("ghost", "9.9")]);
        let resolver = StubResolver {
            first_seen: HashMap::new(),
        };
        let mut cache = StubCache::new(HashMap::new());
        assert!(matches!(
            resolve(&mut buildinfo, &resolver, &mut cache, MIRROR, &[]),
            Err(Error::Snapshot(snapshot::Error::NoBinaryFound(_)))
        ));
    }

    #[test]
    fn test_explicit_foreign_architecture_membership() {
        // A dependency recorded for another architecture is matched against
        // that architecture in the cache, not the build architecture.
        let mut buildinfo = buildinfo_with_depends(&[("libc6", "2.31-13")]);
        buildinfo.build_depends[0].architecture = Some("i386".to_string());
        let mut first_seen = HashMap::new();
        first_seen.insert("libc6".to_string(), "20210504T120000Z".to_string());
        let resolver = StubResolver { first_seen };
        let mut published = HashMap::new();
        published.insert(
            snapshot_source_line(MIRROR, "20210504T120000Z"),
            vec![(
                "libc6".to_string(),
                "2.31-13".to_string(),
                "i386".to_string(),
            )],
        );
        let mut cache = StubCache::new(published);
        let selected = resolve(&mut buildinfo, &resolver, &mut cache, MIRROR, &[]).unwrap();
        assert_eq!(selected.len(), 1);
    }
}

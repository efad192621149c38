//! apt sources.list entries and snapshot source lines.

/// One line of an apt sources list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourcesEntry {
    /// A binary package source.
    Deb {
        /// Mirror URI.
        uri: String,
        /// Distribution name.
        dist: String,
        /// Archive components.
        comps: Vec<String>,
    },
    /// A source package source.
    DebSrc {
        /// Mirror URI.
        uri: String,
        /// Distribution name.
        dist: String,
        /// Archive components.
        comps: Vec<String>,
    },
}

impl SourcesEntry {
    /// Parse a single `deb`/`deb-src` line. Comments and malformed lines
    /// yield `None`.
    pub fn parse(line: &str) -> Option<SourcesEntry> {
        let parts = line.split_whitespace().collect::<Vec<_>>();
        if parts.len() < 3 {
            return None;
        }
        let uri = parts[1].to_string();
        let dist = parts[2].to_string();
        let comps = parts[3..].iter().map(|x| x.to_string()).collect::<Vec<_>>();
        match parts[0] {
            "deb" => Some(SourcesEntry::Deb { uri, dist, comps }),
            "deb-src" => Some(SourcesEntry::DebSrc { uri, dist, comps }),
            _ => None,
        }
    }

    /// URLs of the binary package indexes this entry publishes for `arch`,
    /// without a compression suffix.
    pub fn packages_urls(&self, arch: &str) -> Vec<String> {
        match self {
            SourcesEntry::Deb { uri, dist, comps } => {
                let base = uri.trim_end_matches('/');
                let dist = dist.trim_end_matches('/');
                comps
                    .iter()
                    .map(|comp| {
                        format!("{}/dists/{}/{}/binary-{}/Packages", base, dist, comp, arch)
                    })
                    .collect()
            }
            SourcesEntry::DebSrc { .. } => vec![],
        }
    }
}

/// The apt line for a timestamped snapshot of the unstable archive.
pub fn snapshot_source_line(base_mirror: &str, timestamp: &str) -> String {
    format!("deb {}/{} unstable main", base_mirror, timestamp)
}

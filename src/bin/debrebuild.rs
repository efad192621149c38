use clap::Parser;
use debrebuild::build::Builder;
use debrebuild::rebuild::{Rebuilder, RebuilderOptions};
use debrebuild::snapshot;
use std::io::Write;
use std::path::PathBuf;

#[derive(Parser)]
#[clap(
    about = "Given a buildinfo file from a Debian package, rebuild it in an \
             environment reconstructed from snapshot.debian.org and verify \
             that the artifacts match the recorded checksums."
)]
struct Args {
    /// Input buildinfo file. Local or remote file.
    buildinfo: String,
    /// Directory for the build artifacts.
    #[clap(long, default_value = ".")]
    output: PathBuf,
    /// Which building software should be used.
    #[clap(long, value_enum, default_value = "none")]
    builder: Builder,
    /// API url for querying package and binary information.
    #[clap(long, default_value = snapshot::DEFAULT_QUERY_URL)]
    query_url: String,
    /// Add repository file content to the list of apt sources during the
    /// package build.
    #[clap(long)]
    extra_repository_file: Vec<PathBuf>,
    /// Add key file (.asc) to the list of trusted keys during the package
    /// build.
    #[clap(long)]
    extra_repository_key: Vec<PathBuf>,
    /// GPG keyid to use for signing in-toto metadata.
    #[clap(long)]
    gpg_sign_keyid: Option<String>,
    /// Verify buildinfo GPG signature.
    #[clap(long)]
    gpg_verify: bool,
    /// GPG key to use for buildinfo GPG check.
    #[clap(long)]
    gpg_verify_key: Vec<PathBuf>,
    /// Also offer the current deb.debian.org mirror as a source-package
    /// fallback.
    #[clap(long)]
    current_mirror_fallback: bool,
    /// Proxy address to use.
    #[clap(long)]
    proxy: Option<String>,
    /// Display logger info messages.
    #[clap(long)]
    verbose: bool,
    /// Display logger debug messages.
    #[clap(long)]
    debug: bool,
}

fn canonicalize_all(paths: Vec<PathBuf>, what: &str) -> Result<Vec<PathBuf>, i32> {
    paths
        .into_iter()
        .map(|path| {
            path.canonicalize().map_err(|error| {
                log::error!("Cannot find {}: {}: {}", what, path.display(), error);
                1
            })
        })
        .collect()
}

pub fn main() -> Result<(), i32> {
    let args = Args::parse();

    env_logger::builder()
        .format(|buf, record| writeln!(buf, "{}", record.args()))
        .filter(
            None,
            if args.debug {
                log::LevelFilter::Debug
            } else if args.verbose {
                log::LevelFilter::Info
            } else {
                log::LevelFilter::Error
            },
        )
        .init();

    if args.gpg_verify && args.gpg_verify_key.is_empty() {
        log::error!("Cannot verify buildinfo signature without GPG keyring provided");
        return Err(1);
    }

    let extra_repository_files = canonicalize_all(args.extra_repository_file, "repository file")?;
    let extra_repository_keys = canonicalize_all(args.extra_repository_key, "key file")?;
    let gpg_verify_keys = canonicalize_all(args.gpg_verify_key, "key file")?;

    if let Err(error) = std::fs::create_dir_all(&args.output) {
        log::error!("Cannot create output directory {}: {}", args.output.display(), error);
        return Err(1);
    }
    let output = match args.output.canonicalize() {
        Ok(output) => output,
        Err(error) => {
            log::error!("Cannot find output directory {}: {}", args.output.display(), error);
            return Err(1);
        }
    };

    let options = RebuilderOptions {
        buildinfo: args.buildinfo,
        query_url: args.query_url,
        extra_repository_files,
        extra_repository_keys,
        gpg_sign_keyid: args.gpg_sign_keyid,
        gpg_verify: args.gpg_verify,
        gpg_verify_keys,
        proxy: args.proxy,
        current_mirror_fallback: args.current_mirror_fallback,
        ..Default::default()
    };

    let run = Rebuilder::new(options).and_then(|mut rebuilder| rebuilder.run(args.builder, &output));
    match run {
        Ok(()) => Ok(()),
        Err(error) => {
            log::error!("{}", error);
            Err(1)
        }
    }
}

#![deny(missing_docs)]
//! Library for rebuilding Debian packages from `.buildinfo` files.
//!
//! Given a `.buildinfo` file describing a past build, this crate resolves
//! every pinned build dependency to a snapshot.debian.org timestamp, selects
//! a minimal set of snapshot apt sources covering all of them, synthesizes a
//! build environment for an external chroot builder (mmdebstrap or sbuild),
//! and verifies that the rebuilt artifacts match the recorded checksums.

/// Ephemeral apt root and snapshot package index cache.
pub mod apt;
/// in-toto attestation of rebuilt artifacts.
pub mod attest;
/// `.buildinfo` data model and parser.
pub mod buildinfo;
/// Build plan synthesis and external builder invocation.
pub mod build;
/// Inline signature verification in an isolated GnuPG environment.
pub mod gpg;
/// Orchestration of the whole rebuild pipeline.
pub mod rebuild;
/// Selection of snapshot sources covering the pinned build dependencies.
pub mod resolver;
/// Client for the snapshot archive metadata API.
pub mod snapshot;
/// apt sources.list entries and snapshot source lines.
pub mod sources;
/// Comparison of recorded and rebuilt artifact checksums.
pub mod verify;

//! pkgrelay — a multi-protocol package-registry mirror.
//!
//! The engine sits between dependency resolvers and their upstream
//! registries, serving a rewritten, locally-cached view of each ecosystem's
//! metadata and artifacts. Five mirror kinds are supported: composer
//! (packagist-compatible entry file, provider shards, per-package metadata),
//! npm (per-package documents plus tarballs, scoped names included), git
//! (bare-clone fleet, archives, read-only smart-http), bower (name→URL map)
//! and static file proxying.
//!
//! Every mirror follows the same life cycle: `init` opens its stores, then
//! `serve` runs the periodic sync loop until cancelled. Mirrors write to
//! their own bucket in the key/value store and their own slice of the
//! artifact vault; progress is reported on the shared state bus.

pub mod api;
pub mod bower;
pub mod composer;
pub mod git;
pub mod npm;
pub mod service;
pub mod statics;

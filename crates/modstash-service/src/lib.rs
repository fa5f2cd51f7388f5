//! The coordination core of a module-proxy cache.
//!
//! A module version requested for the first time is fetched from upstream and
//! persisted to a storage backend; every later request is served from storage.
//! The job of this crate is making that happen *at most once concurrently* per
//! (module, version), both within a process and across a fleet of replicas,
//! while staying correct when a replica crashes mid-fetch, a lock backend
//! becomes unreachable, or a caller goes away.
//!
//! The entry point is the [`stash::Stasher`] trait and the wrappers that
//! compose around its base implementation; [`service::create_stasher`]
//! assembles the stack described by a [`config::Config`].

#[macro_use]
pub mod metrics;

pub mod config;
pub mod events;
pub mod fetch;
pub mod lockers;
pub mod logging;
pub mod service;
pub mod stash;
pub mod storage;

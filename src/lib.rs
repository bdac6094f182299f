//! # Ansible Operator
//!
//! A Kubernetes operator that runs Ansible playbooks from git repositories,
//! on schedules or on demand.
//!
//! ## Overview
//!
//! The operator reconciles three custom resources under the
//! `ansible.cloud37.dev/v1alpha1` group:
//!
//! 1. **Repository** - a git repository holding playbooks. Connectivity and
//!    credentials are verified with a probe Job (`git ls-remote`).
//! 2. **Playbook** - binds a playbook path inside a Repository to execution
//!    settings. Paths are validated against an out-of-band clone.
//! 3. **Schedule** - materializes a Playbook as a CronJob, with
//!    deterministic `@hourly-random`-style schedule macros, adoption-safe
//!    CronJob takeover and a concurrency guard.
//!
//! Readiness flows downstream through status conditions: Repository probe
//! results gate Playbook validation, which gates Schedule readiness. An
//! in-memory dependency index nudges dependents with a trigger annotation
//! when an upstream resource changes, rate limited per upstream.
//!
//! Manual runs are requested by annotating a Playbook or Schedule with a
//! caller-chosen run id; the id doubles as the idempotency key.

pub mod builders;
pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod cron;
pub mod dependencies;
pub mod git;
pub mod observability;
pub mod runtime;

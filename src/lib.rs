//! # thrash-protect
//!
//! A Linux user-space daemon that prevents system-wide thrashing by
//! temporarily suspending memory-hungry processes. When swap I/O and
//! memory-pressure indicators cross calibrated thresholds, the daemon
//! selects a culprit process (or cgroup) and suspends it; when pressure
//! subsides it resumes previously suspended work, in a disciplined order.
//! The goal is to let an operator reach the box before the kernel OOM
//! killer acts, and to keep interactive sessions responsive during
//! transient memory storms.
//!
//! `thrash-protect` does not kill processes, rewrite OOM scores, enforce
//! cgroup quotas, interpose on the allocator, or make policy decisions
//! based on user identity. It requires `/proc`, and for the cgroup
//! selector and freezer, cgroup v2 with the freezer and PSI interfaces.
//!
//! ## Module organization
//!
//! - [`procfs`]: stateless readers over `/proc` and `/sys`.
//! - [`state`]: the per-tick [`state::SystemState`] snapshot and
//!   [`state::PidChain`].
//! - [`detector`]: the thrash detector (swap product, PSI amplification,
//!   cooldown evolution, adaptive sleep, timer-alert).
//! - [`predictor`]: the proactive OOM predictor.
//! - [`selectors`]: the process/cgroup selector cascade.
//! - [`freezer`]: the frozen-item registry and freeze/unfreeze operations.
//! - [`eventlog`]: the durable event log and persisted pid-list state file.
//! - [`storage`]: swap-device SSD/HDD detection.
//! - [`config`]: layered configuration resolution (defaults, file, env, CLI).
//! - [`control`]: the control loop and process lifecycle.
//! - [`error`]: the crate's error taxonomy.

pub mod config;
pub mod control;
pub mod detector;
pub mod error;
pub mod eventlog;
pub mod freezer;
pub mod predictor;
pub mod procfs;
pub mod selectors;
pub mod state;
pub mod storage;

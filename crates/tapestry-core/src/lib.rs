//! tapestry-core
//!
//! Sync engine for personal communications: tasks plan, execute and commit
//! mutations; ordered indexes (TOCs) follow the store; the bridge streams
//! list diffs to UI clients.
//!
//! # Modules
//! - **domain**: ids, tasks, lifecycle, mutations, entities, errors
//! - **queue**: resource lock table, groups, retry policy, scheduler
//! - **ports**: store, clock, id generator and overlay seams
//! - **impls**: in-memory store, overlay manager, scripted accounts
//! - **typed**: typed task API (`TaskArgs`, `Handler`, `TaskRegistry`)
//! - **app**: builder, runtime, worker loop, execution context
//! - **toc**: ordered indexes over store collections
//! - **bridge**: named contexts, list proxies, wire format
//! - **account**: composite accounts over receiver/sender capabilities
//! - **tasks**: built-in sync tasks
//! - **config**: TOML engine configuration

pub mod account;
pub mod app;
pub mod bridge;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod queue;
pub mod tasks;
pub mod toc;
pub mod typed;

//! Publisher: deployment orchestration back-end.
//!
//! ## Overview
//!
//! A generated web application is published by `POST /api/publish/{id}`. The
//! request is authenticated, the project is loaded for its owner, and the
//! selected backend either asks the remote hosting platform to build and
//! deploy it or builds it locally with the docker CLI. Build progress is
//! written to the project row as `(last_step, total_steps)` for the
//! front-end's progress bar.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │ Front-end│ ───────> │  server.rs  (axum Router, graceful shutdown)     │
//! │          │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘   JSON   │         │                                        │
//!                       │         │ PublishOrchestrator::publish()         │
//!                       │         v                                        │
//!                       │  orchestrator.rs  (state machine, TaskRegistry)  │
//!                       │         │                                        │
//!                       │         ├─ backend/remote.rs  + coolify.rs       │
//!                       │         │     create / deploy / poll logs        │
//!                       │         │                                        │
//!                       │         └─ backend/docker.rs                     │
//!                       │               build / teardown / push            │
//!                       │                     │                            │
//!                       │                     v                            │
//!                       │  supervisor.rs  (ProcessSupervisor, pids)        │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module     | Responsibility                                              |
//! |------------|-------------------------------------------------------------|
//! | `models`   | `Project`, step totals, domain helpers                      |
//! | `progress` | Step markers in build logs, `StepTracker`                   |
//! | `store`    | `ProjectStore` trait; Postgres (`sqlx`) and SQLite impls    |
//!
//! ## Typical Request Flow (remote platform)
//!
//! 1. `api::publish` checks `X-Auth-Key`, then decodes `{ "userId" }`.
//! 2. The orchestrator loads the project scoped by owner.
//! 3. Without a stored application id, one is created (domain conflicts are
//!    retried with backoff) and persisted; then a deploy is triggered and the
//!    counters are reset to `(0, 12)`.
//! 4. The caller gets `200` while a background task polls the deployment
//!    log, persisting each higher step, until the platform reports
//!    `finished`.

pub mod api;
pub mod backend;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod server;
pub mod store;
pub mod supervisor;

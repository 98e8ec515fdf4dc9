//! Brand studio run orchestrator.
//!
//! ## Overview
//!
//! A run sequences creative-generation stages (ingest, generate, drift
//! check, human review, export) for one client. Each stage drives external
//! tools as child processes. Their output lines become run log entries that
//! are persisted with the run and streamed live to any number of viewers.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │   (UI)   │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘   SSE    │         │        └─ sse.rs (snapshot + events)  │
//!                       │         │ PipelineEngine::create_run()           │
//!                       │         v                                        │
//!                       │  pipeline.rs  (PipelineEngine, ActiveRuns)       │
//!                       │         │  persist ──> store.rs (RunStore)       │
//!                       │         │  publish ──> broadcast.rs              │
//!                       │         │ StageExecutor::execute()               │
//!                       │         v                                        │
//!                       │  executors/  (ingest, generate, drift, review,   │
//!                       │               export, fallback)                  │
//!                       │         │ ProcessRunner::run()                   │
//!                       │         v                                        │
//!                       │  process.rs  (child process, line streaming)     │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module      | Responsibility                                           |
//! |-------------|----------------------------------------------------------|
//! | `models`    | `RunRecord`, stage/log/artifact/review types             |
//! | `registry`  | Static mode → ordered stage list                         |
//! | `clients`   | `ClientDirectory` trait, config-backed implementation    |
//!
//! ## Run Flow
//!
//! 1. `POST /clients/{clientId}/runs` validates the client and mode, freezes
//!    the stage list from `registry`, persists a `ready` run and spawns its
//!    pipeline task.
//! 2. The engine walks the stages in order. Every change is persisted before
//!    it is published, and a stage starts only after the previous outcome is
//!    recorded.
//! 3. A failed stage blocks the run; cancellation kills the live process and
//!    cancels the run; a pending review parks it in `needs_review` until
//!    `POST /runs/{runId}/review/approve|reject`.

pub mod api;
pub mod broadcast;
pub mod clients;
pub mod executors;
pub mod models;
pub mod pipeline;
pub mod process;
pub mod registry;
pub mod server;
pub mod sse;
pub mod store;

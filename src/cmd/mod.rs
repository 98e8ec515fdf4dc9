//! CLI command implementations.
//!
//! | Module    | Commands handled     |
//! |-----------|----------------------|
//! | `serve`   | `Serve`              |
//! | `project` | `Init`, `Stages`     |
//! | `config`  | `Config`             |
//! | `runs`    | `Runs`               |

pub mod config;
pub mod project;
pub mod runs;
pub mod serve;

pub use config::cmd_config;
pub use project::{cmd_init, cmd_stages};
pub use runs::cmd_runs;
pub use serve::cmd_serve;

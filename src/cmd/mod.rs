//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module     | Commands handled          |
//! |------------|---------------------------|
//! | `serve`    | `Serve`                   |
//! | `init`     | `Init`                    |
//! | `config`   | `Config`                  |
//! | `views`    | `Views`                   |
//! | `case`     | `Pendencies`, `Export`    |

pub mod case;
pub mod config;
pub mod init;
pub mod serve;
pub mod views;

pub use case::{cmd_export, cmd_pendencies};
pub use config::cmd_config;
pub use init::cmd_init;
pub use serve::cmd_serve;
pub use views::cmd_views;

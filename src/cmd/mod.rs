//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `stream` | `Stream`         |
//! | `ci`     | `Ci`             |
//! | `config` | `Config`         |

pub mod ci;
pub mod config;
pub mod stream;

pub use ci::cmd_ci;
pub use config::cmd_config;
pub use stream::cmd_stream;

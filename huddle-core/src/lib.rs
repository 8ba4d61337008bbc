mod config;
mod db;
mod events;
mod presence;
mod rooms;
mod util;

pub mod logging;

pub use config::*;
pub use db::*;
pub use events::*;
pub use presence::*;
pub use rooms::*;
pub use util::*;

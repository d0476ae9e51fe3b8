pub mod message;
pub mod of;
pub mod rank;

mod command;
mod config;
mod dag;
mod parent;
mod router;
mod timers;

pub use command::*;
pub use config::*;
pub use dag::*;
pub use parent::*;
pub use router::*;

mod bootstrap;
mod database;

pub use bootstrap::*;
pub use database::*;

//! Persistence substrate: row CRUD on sqlite plus the row-change
//! broadcast fan-out observers subscribe to.

pub mod broadcast;
pub mod db;

pub use broadcast::Broadcaster;
pub use db::Store;

pub mod config;
pub mod consistency;
pub mod error;
pub mod io;
pub mod state;
pub mod store;

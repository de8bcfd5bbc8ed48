pub mod check;
pub mod config;
pub mod send;
pub mod serve;
pub mod version;

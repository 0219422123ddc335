//! Database repositories for each table.

pub mod activity;

pub use activity::ActivityRepo;

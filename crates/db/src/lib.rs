pub mod connection;
pub mod fixtures;
pub mod migrations;
pub mod repositories;

pub use connection::{connect, connect_with, DbPool, PoolSettings};
pub use fixtures::{seed_demo_dataset, DemoDataset};

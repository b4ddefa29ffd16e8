pub mod health;
pub mod manifest;
pub mod segment;

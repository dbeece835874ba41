pub mod dream;
pub mod settings;

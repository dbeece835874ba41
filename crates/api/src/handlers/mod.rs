pub mod dreams;
pub mod images;
pub mod settings;

pub mod dream_repo;
pub mod settings_repo;

pub use dream_repo::DreamRepo;
pub use settings_repo::SettingsRepo;

pub mod attendance;
pub mod backup;
pub mod core;
pub mod directory;
pub mod sessions;
pub mod settings;
pub mod students;

pub mod attendance;
pub mod bundles;
pub mod core;
pub mod directory;
pub mod duplicates;
pub mod examiners;
pub mod marks;
pub mod sheets;
pub mod users;

pub mod application;
pub mod credential;
pub mod directory;

pub mod models;
pub mod security;
pub mod settings;

pub mod admin;
pub mod dialogs;
pub mod export;
pub mod health;
pub mod messages;
pub mod models;
pub mod tokens;

pub mod chat;
pub mod files;
pub mod http;
pub mod logs;
pub mod ws;

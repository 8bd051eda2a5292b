pub mod cloud;
pub mod config;
pub mod doctor;
pub mod download;
pub mod episode;
pub mod feed;
pub mod library;
pub mod player;
pub mod resolver;
pub mod scraper;
pub mod session;
pub mod state;
pub mod sync;

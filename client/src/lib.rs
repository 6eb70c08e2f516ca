pub mod catalog;
pub mod clock;
pub mod config;
pub mod connection;
pub mod console;
pub mod constants;
pub mod home;
pub mod invite;
pub mod mirror;
pub mod player;
pub mod prefs;
pub mod protocol;
pub mod runtime;
pub mod session;
pub mod throttle;
pub mod update;
pub mod utils;

pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod logging;
pub mod repository;
pub mod retry;
pub mod services;

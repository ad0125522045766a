pub mod api;
pub mod config;
pub mod credential;
pub mod domain;
pub mod error;
pub mod gateway;
pub mod notify;
pub mod reconcile;
pub mod repository;

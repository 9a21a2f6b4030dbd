pub mod auth;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod graph;
pub mod matching;
pub mod materialize;
pub mod model;
pub mod schedule;
pub mod web;

//! vidshelf - video library indexer with animated thumbnails
//!
//! The scanner walks configured library roots, keeps a SQLite index of the
//! videos it finds (with categories and tags taken from sidecar files and
//! directory names), and hands thumbnail generation to a bounded background
//! worker.

pub mod cli;
pub mod config;
pub mod db;
pub mod jobs;
pub mod services;

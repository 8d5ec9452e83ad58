pub mod app;
pub mod console;
pub mod event;
pub mod keys;
pub mod strategy;
pub mod ui;

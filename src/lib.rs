pub mod controllers;
pub mod engine;
pub mod filters;
pub mod game;
pub mod models;
pub mod timer;

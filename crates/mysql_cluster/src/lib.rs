pub mod api;
pub mod config;
pub mod controllers;
pub mod resources;
pub mod util;

#[cfg(test)]
pub mod fixtures;

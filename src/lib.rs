pub mod analytics;
pub mod batch;
pub mod collaborators;
pub mod document;
pub mod errors;
pub mod logging;
pub mod mender_config;
pub mod orchestrator;
pub mod repair;
pub mod review;
pub mod ui;

pub mod audit;
pub mod config;
pub mod errors;
pub mod ingest;
pub mod lock;
pub mod logging;
pub mod orchestrator;
pub mod packager;
pub mod persona;
pub mod pipewright_config;
pub mod sandbox;
pub mod store;
pub mod util;

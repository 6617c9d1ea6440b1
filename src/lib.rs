pub mod config;
pub mod errors;
pub mod logging;
pub mod pipeline;
pub mod settings;
pub mod solver;
pub mod store;
pub mod trajectory;
pub mod util;

pub mod agent;
pub mod runner;
pub mod stage;
pub mod state;

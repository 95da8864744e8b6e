//! ferryx worker: joins a coordinator group and turns pushed deploy
//! commands into operation script runs.

pub mod bootstrap;
pub mod config;
pub mod deploy;
pub mod error;
pub mod health;
pub mod hub;
pub mod runner;
pub mod session;
pub mod token;

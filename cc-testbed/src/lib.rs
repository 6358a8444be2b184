pub mod config;
pub mod mutator;
pub mod output;
pub mod sampler;
pub mod simulation;
pub mod topology;

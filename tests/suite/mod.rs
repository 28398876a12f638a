mod cli;
mod lifecycle;
mod queries;
mod resilience;

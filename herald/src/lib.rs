pub mod controller;
pub mod demo;
pub mod notifier;
pub mod simulated;

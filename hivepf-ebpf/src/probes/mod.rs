pub mod scheduler;
pub mod watchdog;

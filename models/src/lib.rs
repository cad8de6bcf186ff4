pub mod constants;
pub mod job;
pub mod pod;
pub mod telemetry;
pub mod topology;

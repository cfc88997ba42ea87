pub mod exec;
pub mod serve;

pub mod assignment;
pub mod duplicates;
pub mod merge;
pub mod scoring;

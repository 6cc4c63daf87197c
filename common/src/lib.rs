pub mod config;
pub mod frame;
pub mod multipart;
pub mod slot;
pub mod verdict;

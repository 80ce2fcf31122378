pub mod config;
pub mod error;
pub mod office_paths;
pub mod office_process;
pub mod process_manager;
pub mod profile_dir;
pub mod retry;
pub mod runner;

#[cfg(test)]
mod testing;

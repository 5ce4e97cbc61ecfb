pub mod centroid;
pub mod fits_header;
pub mod header_store;
pub mod image_utils;
pub mod nova_client;
pub mod peak_finder;
pub mod poll;
pub mod progress;
pub mod run_stats;
pub mod slice_solver;
pub mod solve_config;
pub mod solve_engine;
pub mod solver_trait;
pub mod source_list;
pub mod stack_solver;
pub mod wcs_merge;
pub mod wire;

#[cfg(test)]
mod test_support;

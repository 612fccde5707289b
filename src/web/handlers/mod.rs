pub mod prospects;
pub mod runs;

pub mod errors;
pub mod history;
pub mod job;
pub mod params;

pub use errors::*;
pub use history::*;
pub use job::*;
pub use params::*;

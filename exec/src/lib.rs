mod error;
mod linker;
mod manager;
mod memory;
mod process_maps;
mod resolver;
mod scope;
mod target;
mod tracker;
mod unit;

pub use error::*;
pub use manager::*;
pub use memory::*;
pub use process_maps::*;
pub use resolver::*;
pub use scope::*;
pub use target::*;
pub use tracker::*;
pub use unit::*;

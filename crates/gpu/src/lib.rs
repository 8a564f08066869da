pub use cstr::cstr;

pub extern crate ash;

mod commands;
mod device;
mod error;
#[cfg(feature = "mock")]
pub mod mock;
mod resources;
mod shader;
pub mod vulkan;

pub use commands::*;
pub use device::*;
pub use error::{Error, Result};
pub use resources::*;
pub use shader::*;

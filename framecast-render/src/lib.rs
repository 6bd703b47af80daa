//! Rendering engine: compositor, raster primitives, text layout, chat
//! panel, animation subsystem, render cache, and the priority render
//! worker pool.

pub mod anim;
pub mod cache;
pub mod chat_panel;
pub mod compositor;
pub mod error;
pub mod frame;
pub mod pool;
pub mod raster;
pub mod text;

pub use compositor::{Compositor, CompositorConfig};
pub use error::{RenderError, RenderResult};
pub use frame::Frame;
pub use pool::{RenderPool, RenderPoolConfig, TaskPriority};

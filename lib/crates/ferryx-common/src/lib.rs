pub mod contract;
pub mod group;
pub mod meta;
pub mod template;
pub mod types;

pub use group::sanitize_group;
pub use meta::{MetaValue, Scalar};
pub use template::{DEFAULT_TEMPLATE, RenderContext, render};
pub use types::*;

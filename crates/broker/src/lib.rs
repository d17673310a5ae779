pub mod info;
pub mod rest;
pub mod stream;

pub use info::*;
pub use rest::*;
pub use stream::*;

pub mod error;
pub mod matrix;
pub mod template;
pub mod tree;

pub mod defer;
pub mod fs;
pub mod pool;
pub mod project;

pub mod condition;
pub mod info;
pub mod media;
pub mod path;
pub mod simple;
pub mod strategy;

pub mod kind;
pub mod manifest;

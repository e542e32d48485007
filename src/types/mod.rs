pub mod location;
pub mod measure;
pub mod variable;

pub mod model;
pub mod safe;

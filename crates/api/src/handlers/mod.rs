pub mod organizations;
pub mod renders;
pub mod reviews;

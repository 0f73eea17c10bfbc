pub mod identity;
pub mod level;
pub mod request;

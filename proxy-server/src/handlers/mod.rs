pub mod banner;
pub mod proxy;

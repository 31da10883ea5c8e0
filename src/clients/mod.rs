pub mod carrier;
pub mod cart;
pub mod gateway;

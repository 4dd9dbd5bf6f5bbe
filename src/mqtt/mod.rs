mod acks;
mod connection;
mod messages;

pub use connection::connect;

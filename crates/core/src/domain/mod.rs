pub mod conversation;
pub mod persona;

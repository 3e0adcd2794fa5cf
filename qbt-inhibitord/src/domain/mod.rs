pub mod inhibit;
pub mod protocol;

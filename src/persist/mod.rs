pub mod fstab;
pub mod unit;

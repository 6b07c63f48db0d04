pub mod blkid;
pub mod cmd;
pub mod host;
pub mod luks2;
pub mod mkfs;
pub mod mount;

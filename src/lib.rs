pub mod alert;
pub mod avg;
pub mod bencode;
pub mod blockinfo;
pub mod conf;
pub mod counter;
pub mod disk;
pub mod engine;
pub mod error;
pub mod magnet;
pub mod metainfo;
pub mod peer;
pub mod piece;
pub mod rpc;
pub mod storage_info;
pub mod torrent;
pub mod tracker;

mod define;
pub use define::*;
